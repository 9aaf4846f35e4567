//! libpdfium through pdfium-render's raw bindings (dynamically linked).
//!
//! Progressive rendering and form-fill environments hand libpdfium C
//! trampolines. They reach the caller's [`CallbackBridge`] through a
//! [`Borrowed`] that lives on the stack of the library call raising them.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::ffi::{CStr, c_int, c_void};
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

use pdfium_render::bindgen::{
    FPDF_BOOL, FPDF_BYTESTRING, FPDF_DOCUMENT, FPDF_FORMFILLINFO, FPDF_PAGE, FPDF_SYSTEMTIME,
    IFSDK_PAUSE, TimerCallback,
};
use pdfium_render::prelude::*;
use tracing::{debug, info, warn};

use crate::error::{PdfiumErrorCode, PoolError, PoolResult};
use crate::protocol::{
    AnnotationSubtype, CallbackReply, CallbackRequest, FormCallbackKind, LocalTime, NativeError,
    NativePage, RenderArea, RenderStatus, SearchFlags, TtfMapEntry,
};

use super::{CallbackBridge, NativeLibrary, NativeResult};

/// libpdfium keeps process-wide state; only one binding may be live.
static BOUND: AtomicBool = AtomicBool::new(false);

fn to_native<T>(pointer: *mut T) -> u64 {
    pointer as usize as u64
}

fn last_error(bindings: &dyn PdfiumLibraryBindings) -> NativeError {
    let code = bindings.FPDF_GetLastError() as u32;
    NativeError::LastError {
        code: if code == PdfiumErrorCode::SUCCESS {
            PdfiumErrorCode::UNKNOWN
        } else {
            code
        },
    }
}

/// `FPDF_RENDER_*` status codes.
fn render_status(code: c_int) -> RenderStatus {
    match code {
        0 => RenderStatus::Ready,
        1 => RenderStatus::ToBeContinued,
        2 => RenderStatus::Done,
        _ => RenderStatus::Failed,
    }
}

fn unexpected_reply(callback: &str, reply: &CallbackReply) -> NativeError {
    NativeError::Callback {
        message: format!("unexpected reply to {}: {:?}", callback, reply),
    }
}

/// A callback bridge lent to C trampolines for one library call.
///
/// Trampolines cannot return errors to libpdfium, so the first failure is
/// kept and every later callback of the call gets a neutral answer.
struct Borrowed {
    bridge: *mut (dyn CallbackBridge + 'static),
    error: Option<NativeError>,
}

impl Borrowed {
    fn new(bridge: &mut dyn CallbackBridge) -> Self {
        // SAFETY: a Borrowed lives on the stack of the library call it was
        // made for, and trampolines only run inside that call, so the
        // bridge outlives every dereference.
        let bridge = unsafe {
            std::mem::transmute::<&mut dyn CallbackBridge, *mut (dyn CallbackBridge + 'static)>(
                bridge,
            )
        };
        Self {
            bridge,
            error: None,
        }
    }

    fn invoke(&mut self, request: CallbackRequest) -> Option<CallbackReply> {
        if self.error.is_some() {
            return None;
        }
        // SAFETY: see `new`
        match unsafe { (*self.bridge).invoke(request) } {
            Ok(reply) => Some(reply),
            Err(e) => {
                self.error = Some(e);
                None
            }
        }
    }

    fn fail(&mut self, error: NativeError) {
        self.error.get_or_insert(error);
    }

    fn finish<T>(self, value: T) -> NativeResult<T> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(value),
        }
    }
}

unsafe extern "C" fn need_to_pause_now(pause: *mut IFSDK_PAUSE) -> FPDF_BOOL {
    // SAFETY: libpdfium passes back the IFSDK_PAUSE given to the render
    // call; its user pointer is null or the Borrowed of that call.
    let borrowed = unsafe {
        if pause.is_null() || (*pause).user.is_null() {
            return 0;
        }
        &mut *((*pause).user as *mut Borrowed)
    };
    match borrowed.invoke(CallbackRequest::NeedToPauseNow) {
        Some(CallbackReply::Pause { pause }) => FPDF_BOOL::from(pause),
        Some(other) => {
            borrowed.fail(unexpected_reply("NeedToPauseNow", &other));
            0
        }
        None => 0,
    }
}

/// `IFSDK_PAUSE` for one render call. Without a bridge it never pauses.
fn pause_interface(borrowed: Option<&mut Borrowed>) -> IFSDK_PAUSE {
    IFSDK_PAUSE {
        version: 1,
        NeedToPauseNow: Some(need_to_pause_now),
        user: borrowed.map_or(ptr::null_mut(), |b| b as *mut Borrowed as *mut c_void),
    }
}

/// `FPDF_FORMFILLINFO` handed to libpdfium, followed by what its trampolines
/// need. libpdfium passes the info pointer back, which is also a pointer to
/// the whole environment.
#[repr(C)]
struct FormEnvironment {
    info: FPDF_FORMFILLINFO,
    /// Bridge of the library call currently running on this form
    active: Cell<*mut Borrowed>,
}

impl FormEnvironment {
    fn new(callbacks: &[FormCallbackKind]) -> Box<Self> {
        // SAFETY: FPDF_FORMFILLINFO is plain C data; all-zero is a valid
        // value with every callback unset.
        let mut info: FPDF_FORMFILLINFO = unsafe { std::mem::zeroed() };
        info.version = 2;
        for kind in callbacks {
            match kind {
                FormCallbackKind::Invalidate => info.FFI_Invalidate = Some(form_invalidate),
                FormCallbackKind::SetCursor => info.FFI_SetCursor = Some(form_set_cursor),
                FormCallbackKind::SetTimer => info.FFI_SetTimer = Some(form_set_timer),
                FormCallbackKind::KillTimer => info.FFI_KillTimer = Some(form_kill_timer),
                FormCallbackKind::GetLocalTime => info.FFI_GetLocalTime = Some(form_get_local_time),
                FormCallbackKind::GetPage => info.FFI_GetPage = Some(form_get_page),
                FormCallbackKind::GetCurrentPage => {
                    info.FFI_GetCurrentPage = Some(form_get_current_page)
                }
                FormCallbackKind::GetRotation => info.FFI_GetRotation = Some(form_get_rotation),
                FormCallbackKind::ExecuteNamedAction => {
                    info.FFI_ExecuteNamedAction = Some(form_execute_named_action)
                }
                FormCallbackKind::OnChange => info.FFI_OnChange = Some(form_on_change),
            }
        }
        Box::new(Self {
            info,
            active: Cell::new(ptr::null_mut()),
        })
    }

    /// Run `call` with `bridge` reachable from this form's trampolines.
    fn with_bridge<T>(
        &self,
        bridge: &mut dyn CallbackBridge,
        call: impl FnOnce() -> T,
    ) -> NativeResult<T> {
        let mut borrowed = Borrowed::new(bridge);
        self.active.set(&mut borrowed);
        let value = call();
        self.active.set(ptr::null_mut());
        borrowed.finish(value)
    }
}

/// Bridge of the call running on the form behind `this`. `None` when
/// libpdfium raises a callback outside any call, for example while closing.
///
/// # Safety
///
/// `this` must be null or the `info` of a live [`FormEnvironment`].
unsafe fn active_bridge<'a>(this: *mut FPDF_FORMFILLINFO) -> Option<&'a mut Borrowed> {
    if this.is_null() {
        return None;
    }
    // SAFETY: `info` is the first field of the repr(C) FormEnvironment
    let active = unsafe { &*(this as *const FormEnvironment) }.active.get();
    // SAFETY: a non-null active pointer is the Borrowed of the running call
    unsafe { active.as_mut() }
}

fn to_page(page: Option<u64>) -> FPDF_PAGE {
    page.map_or(ptr::null_mut(), |page| page as usize as FPDF_PAGE)
}

unsafe extern "C" fn form_invalidate(
    this: *mut FPDF_FORMFILLINFO,
    page: FPDF_PAGE,
    left: f64,
    top: f64,
    right: f64,
    bottom: f64,
) {
    if let Some(borrowed) = unsafe { active_bridge(this) } {
        borrowed.invoke(CallbackRequest::FormInvalidate {
            page: to_native(page),
            left,
            top,
            right,
            bottom,
        });
    }
}

unsafe extern "C" fn form_set_cursor(this: *mut FPDF_FORMFILLINFO, cursor: c_int) {
    if let Some(borrowed) = unsafe { active_bridge(this) } {
        borrowed.invoke(CallbackRequest::FormSetCursor { cursor });
    }
}

// libpdfium's timer function is not kept: timers fire on the caller's side,
// which has no way back into this call.
unsafe extern "C" fn form_set_timer(
    this: *mut FPDF_FORMFILLINFO,
    elapse_ms: c_int,
    _timer: TimerCallback,
) -> c_int {
    let Some(borrowed) = (unsafe { active_bridge(this) }) else {
        return 0;
    };
    match borrowed.invoke(CallbackRequest::FormSetTimer { elapse_ms }) {
        Some(CallbackReply::TimerId { timer_id }) => timer_id,
        Some(other) => {
            borrowed.fail(unexpected_reply("FFI_SetTimer", &other));
            0
        }
        None => 0,
    }
}

unsafe extern "C" fn form_kill_timer(this: *mut FPDF_FORMFILLINFO, timer_id: c_int) {
    if let Some(borrowed) = unsafe { active_bridge(this) } {
        borrowed.invoke(CallbackRequest::FormKillTimer { timer_id });
    }
}

unsafe extern "C" fn form_get_local_time(this: *mut FPDF_FORMFILLINFO) -> FPDF_SYSTEMTIME {
    let time = match unsafe { active_bridge(this) } {
        Some(borrowed) => match borrowed.invoke(CallbackRequest::FormGetLocalTime) {
            Some(CallbackReply::LocalTime { time }) => time,
            Some(other) => {
                borrowed.fail(unexpected_reply("FFI_GetLocalTime", &other));
                LocalTime::default()
            }
            None => LocalTime::default(),
        },
        None => LocalTime::default(),
    };
    FPDF_SYSTEMTIME {
        wYear: time.year,
        wMonth: time.month,
        wDayOfWeek: time.day_of_week,
        wDay: time.day,
        wHour: time.hour,
        wMinute: time.minute,
        wSecond: time.second,
        wMilliseconds: time.milliseconds,
    }
}

unsafe extern "C" fn form_on_change(this: *mut FPDF_FORMFILLINFO) {
    if let Some(borrowed) = unsafe { active_bridge(this) } {
        borrowed.invoke(CallbackRequest::FormOnChange);
    }
}

fn page_reply(borrowed: &mut Borrowed, callback: &str, request: CallbackRequest) -> FPDF_PAGE {
    match borrowed.invoke(request) {
        Some(CallbackReply::Page { page }) => to_page(page),
        Some(other) => {
            borrowed.fail(unexpected_reply(callback, &other));
            ptr::null_mut()
        }
        None => ptr::null_mut(),
    }
}

unsafe extern "C" fn form_get_page(
    this: *mut FPDF_FORMFILLINFO,
    document: FPDF_DOCUMENT,
    index: c_int,
) -> FPDF_PAGE {
    match unsafe { active_bridge(this) } {
        Some(borrowed) => page_reply(
            borrowed,
            "FFI_GetPage",
            CallbackRequest::FormGetPage {
                document: to_native(document),
                index,
            },
        ),
        None => ptr::null_mut(),
    }
}

unsafe extern "C" fn form_get_current_page(
    this: *mut FPDF_FORMFILLINFO,
    document: FPDF_DOCUMENT,
) -> FPDF_PAGE {
    match unsafe { active_bridge(this) } {
        Some(borrowed) => page_reply(
            borrowed,
            "FFI_GetCurrentPage",
            CallbackRequest::FormGetCurrentPage {
                document: to_native(document),
            },
        ),
        None => ptr::null_mut(),
    }
}

unsafe extern "C" fn form_get_rotation(this: *mut FPDF_FORMFILLINFO, page: FPDF_PAGE) -> c_int {
    let Some(borrowed) = (unsafe { active_bridge(this) }) else {
        return 0;
    };
    match borrowed.invoke(CallbackRequest::FormGetRotation {
        page: to_native(page),
    }) {
        Some(CallbackReply::Rotation { rotation }) => rotation,
        Some(other) => {
            borrowed.fail(unexpected_reply("FFI_GetRotation", &other));
            0
        }
        None => 0,
    }
}

unsafe extern "C" fn form_execute_named_action(
    this: *mut FPDF_FORMFILLINFO,
    name: FPDF_BYTESTRING,
) {
    let Some(borrowed) = (unsafe { active_bridge(this) }) else {
        return;
    };
    let name = if name.is_null() {
        String::new()
    } else {
        // SAFETY: libpdfium passes a NUL-terminated action name
        unsafe { CStr::from_ptr(name) }
            .to_string_lossy()
            .into_owned()
    };
    borrowed.invoke(CallbackRequest::FormExecuteNamedAction { name });
}

#[derive(Default)]
struct State {
    /// Source buffers of memory-loaded documents, alive until close
    buffers: HashMap<u64, Vec<u8>>,
    index_pages: HashMap<u64, (i32, u64)>,
    /// Pages with a progressive render not yet closed
    renders: HashSet<u64>,
    /// Form environments by form handle, alive until exit
    forms: HashMap<u64, Box<FormEnvironment>>,
}

/// [`NativeLibrary`] backed by libpdfium.
pub struct PdfiumLibrary {
    bindings: Box<dyn PdfiumLibraryBindings>,
    state: RefCell<State>,
}

// SAFETY: PdfiumLibrary is Send because:
//
// 1. The bindings are function pointers into a dynamically loaded library
//    plus the library handle; neither is tied to the loading thread.
// 2. A PdfiumLibrary is owned by exactly one worker, whose execution lock
//    serializes every call, so libpdfium is never entered concurrently.
// 3. Form environments and the bridges they point at are only touched
//    inside those serialized calls.
// 4. It is not Sync; no shared reference crosses threads.
unsafe impl Send for PdfiumLibrary {}

impl PdfiumLibrary {
    /// Bind libpdfium from `path`, then `./`, then the system library.
    pub fn bind(path: Option<&Path>) -> PoolResult<Self> {
        if BOUND.swap(true, Ordering::SeqCst) {
            return Err(PoolError::Config {
                message: "libpdfium is already bound in this process".to_string(),
            });
        }

        let local = path
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| "./".to_string());
        let bindings = Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(
            &local,
        ))
        .or_else(|_| Pdfium::bind_to_system_library())
        .map_err(|e| {
            BOUND.store(false, Ordering::SeqCst);
            PoolError::Config {
                message: format!("Failed to load PDFium library: {:?}", e),
            }
        })?;

        bindings.FPDF_InitLibrary();
        info!(path = %local, "Bound libpdfium");

        Ok(Self {
            bindings,
            state: RefCell::new(State::default()),
        })
    }

    fn bindings(&self) -> &dyn PdfiumLibraryBindings {
        self.bindings.as_ref()
    }

    /// Finish a progressive render left open on `page`.
    fn close_render(&self, page: u64) {
        if self.state.borrow_mut().renders.remove(&page) {
            self.bindings().FPDF_RenderPage_Close(page as usize as _);
        }
    }

    fn form_environment(&self, form: u64) -> NativeResult<*const FormEnvironment> {
        self.state
            .borrow()
            .forms
            .get(&form)
            .map(|environment| &**environment as *const FormEnvironment)
            .ok_or_else(|| NativeError::failed("invalid form handle"))
    }
}

impl Drop for PdfiumLibrary {
    fn drop(&mut self) {
        let forms: Vec<_> = self.state.get_mut().forms.drain().collect();
        if !forms.is_empty() {
            warn!(forms = forms.len(), "Exiting form environments left open");
        }
        for (form, _environment) in forms {
            self.bindings.FPDFDOC_ExitFormFillEnvironment(form as usize as _);
        }
        self.bindings.FPDF_DestroyLibrary();
        BOUND.store(false, Ordering::SeqCst);
        debug!("Released libpdfium");
    }
}

impl NativeLibrary for PdfiumLibrary {
    fn name(&self) -> &str {
        "pdfium"
    }

    fn load_document(&self, data: &[u8], password: Option<&str>) -> NativeResult<u64> {
        let buffer = data.to_vec();
        let document = self.bindings().FPDF_LoadMemDocument64(&buffer, password);
        if document.is_null() {
            return Err(last_error(self.bindings()));
        }
        let document = to_native(document);
        self.state.borrow_mut().buffers.insert(document, buffer);
        Ok(document)
    }

    fn load_document_from_path(&self, path: &Path, password: Option<&str>) -> NativeResult<u64> {
        let path = path.to_str().ok_or(NativeError::LastError {
            code: PdfiumErrorCode::FILE,
        })?;
        let document = self.bindings().FPDF_LoadDocument(path, password);
        if document.is_null() {
            return Err(last_error(self.bindings()));
        }
        Ok(to_native(document))
    }

    fn close_document(&self, document: u64) -> NativeResult<()> {
        let index_page = self.state.borrow_mut().index_pages.remove(&document);
        if let Some((_, page)) = index_page {
            self.close_render(page);
            self.bindings().FPDF_ClosePage(page as usize as _);
        }
        self.bindings().FPDF_CloseDocument(document as usize as _);
        self.state.borrow_mut().buffers.remove(&document);
        Ok(())
    }

    fn page_count(&self, document: u64) -> NativeResult<i32> {
        Ok(self.bindings().FPDF_GetPageCount(document as usize as _))
    }

    fn load_page(&self, document: u64, index: i32) -> NativeResult<u64> {
        let page = self.bindings().FPDF_LoadPage(document as usize as _, index);
        if page.is_null() {
            return Err(NativeError::LastError {
                code: PdfiumErrorCode::PAGE,
            });
        }
        Ok(to_native(page))
    }

    fn close_page(&self, page: u64) -> NativeResult<()> {
        self.close_render(page);
        self.bindings().FPDF_ClosePage(page as usize as _);
        Ok(())
    }

    fn page_for(&self, page: NativePage) -> NativeResult<u64> {
        match page {
            NativePage::Reference { page } => Ok(page),
            NativePage::Index { document, index } => {
                let cached = self.state.borrow().index_pages.get(&document).copied();
                match cached {
                    Some((cached_index, page)) if cached_index == index => Ok(page),
                    _ => {
                        let page = self.load_page(document, index)?;
                        if let Some((_, previous)) = cached {
                            self.close_page(previous)?;
                        }
                        self.state
                            .borrow_mut()
                            .index_pages
                            .insert(document, (index, page));
                        Ok(page)
                    }
                }
            }
        }
    }

    fn page_size(&self, page: u64) -> NativeResult<(f32, f32)> {
        let bindings = self.bindings();
        Ok((
            bindings.FPDF_GetPageWidthF(page as usize as _),
            bindings.FPDF_GetPageHeightF(page as usize as _),
        ))
    }

    fn load_text_page(&self, page: u64) -> NativeResult<u64> {
        let text_page = self.bindings().FPDFText_LoadPage(page as usize as _);
        if text_page.is_null() {
            return Err(NativeError::failed("could not load text page"));
        }
        Ok(to_native(text_page))
    }

    fn close_text_page(&self, text_page: u64) -> NativeResult<()> {
        self.bindings().FPDFText_ClosePage(text_page as usize as _);
        Ok(())
    }

    fn count_chars(&self, text_page: u64) -> NativeResult<i32> {
        let count = self.bindings().FPDFText_CountChars(text_page as usize as _);
        if count < 0 {
            return Err(NativeError::failed("could not count chars"));
        }
        Ok(count)
    }

    fn find_start(
        &self,
        text_page: u64,
        query: &str,
        flags: SearchFlags,
        start_index: i32,
    ) -> NativeResult<u64> {
        let wide: Vec<u16> = query.encode_utf16().chain(std::iter::once(0)).collect();
        let search = self.bindings().FPDFText_FindStart(
            text_page as usize as _,
            wide.as_ptr(),
            flags.bits() as _,
            start_index,
        );
        if search.is_null() {
            return Err(NativeError::failed("could not start search"));
        }
        Ok(to_native(search))
    }

    fn find_next(&self, search: u64) -> NativeResult<bool> {
        Ok(self.bindings().FPDFText_FindNext(search as usize as _) != 0)
    }

    fn find_close(&self, search: u64) -> NativeResult<()> {
        self.bindings().FPDFText_FindClose(search as usize as _);
        Ok(())
    }

    fn create_bitmap(&self, width: i32, height: i32, alpha: bool) -> NativeResult<u64> {
        let bitmap = self
            .bindings()
            .FPDFBitmap_Create(width, height, i32::from(alpha));
        if bitmap.is_null() {
            return Err(NativeError::failed("could not create bitmap"));
        }
        Ok(to_native(bitmap))
    }

    fn destroy_bitmap(&self, bitmap: u64) -> NativeResult<()> {
        self.bindings().FPDFBitmap_Destroy(bitmap as usize as _);
        Ok(())
    }

    fn annotation_count(&self, page: u64) -> NativeResult<i32> {
        Ok(self.bindings().FPDFPage_GetAnnotCount(page as usize as _))
    }

    fn create_annotation(&self, page: u64, subtype: AnnotationSubtype) -> NativeResult<u64> {
        let annotation = self
            .bindings()
            .FPDFPage_CreateAnnot(page as usize as _, subtype.code() as _);
        if annotation.is_null() {
            return Err(NativeError::failed("could not create annotation"));
        }
        Ok(to_native(annotation))
    }

    fn close_annotation(&self, annotation: u64) -> NativeResult<()> {
        self.bindings().FPDFPage_CloseAnnot(annotation as usize as _);
        Ok(())
    }

    fn remove_annotation(&self, page: u64, index: i32) -> NativeResult<()> {
        if self
            .bindings()
            .FPDFPage_RemoveAnnot(page as usize as _, index)
            == 0
        {
            return Err(NativeError::failed("could not remove annotation"));
        }
        Ok(())
    }

    fn render_start(
        &self,
        bitmap: u64,
        page: u64,
        area: RenderArea,
        pause: Option<&mut dyn CallbackBridge>,
    ) -> NativeResult<RenderStatus> {
        self.close_render(page);
        let mut borrowed = pause.map(Borrowed::new);
        let mut interface = pause_interface(borrowed.as_mut());
        let status = render_status(self.bindings().FPDF_RenderPageBitmap_Start(
            bitmap as usize as _,
            page as usize as _,
            area.start_x,
            area.start_y,
            area.size_x,
            area.size_y,
            area.rotate,
            area.flags,
            &mut interface,
        ));
        self.state.borrow_mut().renders.insert(page);
        debug!(page, status = ?status, "Render started");
        match borrowed {
            Some(borrowed) => borrowed.finish(status),
            None => Ok(status),
        }
    }

    fn render_continue(
        &self,
        page: u64,
        pause: Option<&mut dyn CallbackBridge>,
    ) -> NativeResult<RenderStatus> {
        if !self.state.borrow().renders.contains(&page) {
            return Ok(RenderStatus::Failed);
        }
        let mut borrowed = pause.map(Borrowed::new);
        let mut interface = pause_interface(borrowed.as_mut());
        let status = render_status(
            self.bindings()
                .FPDF_RenderPage_Continue(page as usize as _, &mut interface),
        );
        match borrowed {
            Some(borrowed) => borrowed.finish(status),
            None => Ok(status),
        }
    }

    fn render_close(&self, page: u64) -> NativeResult<()> {
        self.close_render(page);
        Ok(())
    }

    fn init_form_fill(
        &self,
        document: u64,
        callbacks: &[FormCallbackKind],
        bridge: &mut dyn CallbackBridge,
    ) -> NativeResult<u64> {
        let mut environment = FormEnvironment::new(callbacks);
        let info: *mut FPDF_FORMFILLINFO = &mut environment.info;
        let form = environment.with_bridge(bridge, || {
            self.bindings()
                .FPDFDOC_InitFormFillEnvironment(document as usize as _, info)
        })?;
        if form.is_null() {
            return Err(NativeError::failed("could not create form fill environment"));
        }
        let form = to_native(form);
        self.state.borrow_mut().forms.insert(form, environment);
        Ok(form)
    }

    fn exit_form_fill(&self, form: u64, bridge: &mut dyn CallbackBridge) -> NativeResult<()> {
        let environment = self
            .state
            .borrow_mut()
            .forms
            .remove(&form)
            .ok_or_else(|| NativeError::failed("invalid form handle"))?;
        environment.with_bridge(bridge, || {
            self.bindings()
                .FPDFDOC_ExitFormFillEnvironment(form as usize as _)
        })
    }

    fn form_on_after_load_page(
        &self,
        page: u64,
        form: u64,
        bridge: &mut dyn CallbackBridge,
    ) -> NativeResult<()> {
        let environment = self.form_environment(form)?;
        // SAFETY: environments are boxed and only dropped by
        // `exit_form_fill`, which cannot run while this call holds the
        // worker.
        let environment = unsafe { &*environment };
        environment.with_bridge(bridge, || {
            self.bindings()
                .FORM_OnAfterLoadPage(page as usize as _, form as usize as _)
        })
    }

    fn default_ttf_map(&self) -> NativeResult<Vec<TtfMapEntry>> {
        let mut entry = self.bindings().FPDF_GetDefaultTTFMap();
        if entry.is_null() {
            return Err(NativeError::failed("no default TTF map"));
        }
        let mut entries = Vec::new();
        // SAFETY: the default map is a static array ended by charset -1
        unsafe {
            while (*entry).charset != -1 {
                let font_name = if (*entry).fontname.is_null() {
                    String::new()
                } else {
                    CStr::from_ptr((*entry).fontname)
                        .to_string_lossy()
                        .into_owned()
                };
                entries.push(TtfMapEntry {
                    charset: (*entry).charset,
                    font_name,
                });
                entry = entry.add(1);
            }
        }
        Ok(entries)
    }
}
