//! Deterministic in-memory library.
//!
//! Understands just enough of a PDF to drive every operation: the `%PDF-`
//! header, `/Type /Page` objects with an optional `/MediaBox` and `/Text`
//! string, and an `/Encrypt` dictionary whose `/U` string is the user
//! password. Native values are allocated from a counter, so two instances
//! hand out the same values for the same call sequence.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::path::Path;

use tracing::trace;

use crate::error::PdfiumErrorCode;
use crate::protocol::{
    AnnotationSubtype, CallbackReply, CallbackRequest, FormCallbackKind, NativeError, NativePage,
    RenderArea, RenderStatus, SearchFlags, TtfMapEntry,
};

use super::{CallbackBridge, NativeLibrary, NativeResult};

const FIRST_NATIVE: u64 = 0x1000;
const NATIVE_STRIDE: u64 = 0x10;
/// Progressive render steps before a page is done.
const RENDER_STEPS: u32 = 3;
const FORM_TIMER_ELAPSE_MS: i32 = 500;
const DEFAULT_MEDIA_BOX: (f32, f32) = (612.0, 792.0);

#[derive(Debug, Clone)]
struct PageData {
    width: f32,
    height: f32,
    text: String,
    annotations: Vec<AnnotationSubtype>,
}

struct Document {
    pages: Vec<PageData>,
    /// Page loaded implicitly for index-based page arguments
    index_page: Option<(i32, u64)>,
}

struct LoadedPage {
    document: u64,
    index: usize,
    render: Option<RenderProgress>,
}

struct RenderProgress {
    bitmap: u64,
    steps_done: u32,
}

struct TextPage {
    text: String,
}

struct Search {
    matches: Vec<usize>,
    next: usize,
}

struct Annotation {
    page: u64,
}

struct Form {
    document: u64,
    callbacks: HashSet<FormCallbackKind>,
    timers: Vec<i32>,
}

#[derive(Default)]
struct State {
    documents: HashMap<u64, Document>,
    pages: HashMap<u64, LoadedPage>,
    text_pages: HashMap<u64, TextPage>,
    searches: HashMap<u64, Search>,
    bitmaps: HashMap<u64, (i32, i32, bool)>,
    annotations: HashMap<u64, Annotation>,
    forms: HashMap<u64, Form>,
}

impl State {
    fn document(&self, document: u64) -> NativeResult<&Document> {
        self.documents
            .get(&document)
            .ok_or_else(|| NativeError::failed("invalid document"))
    }

    fn page(&self, page: u64) -> NativeResult<&LoadedPage> {
        self.pages
            .get(&page)
            .ok_or_else(|| NativeError::failed("invalid page"))
    }

    fn page_data(&self, page: u64) -> NativeResult<&PageData> {
        let loaded = self.page(page)?;
        self.document(loaded.document)?
            .pages
            .get(loaded.index)
            .ok_or_else(|| NativeError::failed("invalid page"))
    }

    fn page_data_mut(&mut self, page: u64) -> NativeResult<&mut PageData> {
        let (document, index) = {
            let loaded = self.page(page)?;
            (loaded.document, loaded.index)
        };
        self.documents
            .get_mut(&document)
            .and_then(|d| d.pages.get_mut(index))
            .ok_or_else(|| NativeError::failed("invalid page"))
    }
}

/// In-memory [`NativeLibrary`].
pub struct MemoryLibrary {
    state: RefCell<State>,
    next_native: Cell<u64>,
}

impl Default for MemoryLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLibrary {
    pub fn new() -> Self {
        Self {
            state: RefCell::new(State::default()),
            next_native: Cell::new(FIRST_NATIVE),
        }
    }

    fn allocate(&self) -> u64 {
        let native = self.next_native.get();
        self.next_native.set(native + NATIVE_STRIDE);
        native
    }

    fn open_page(&self, document: u64, index: i32) -> NativeResult<u64> {
        let page_count = self.state.borrow().document(document)?.pages.len();
        let index = usize::try_from(index)
            .ok()
            .filter(|i| *i < page_count)
            .ok_or(NativeError::LastError {
                code: PdfiumErrorCode::PAGE,
            })?;

        let page = self.allocate();
        self.state.borrow_mut().pages.insert(
            page,
            LoadedPage {
                document,
                index,
                render: None,
            },
        );
        Ok(page)
    }

    /// One progressive render step, then the pause check if there is more
    /// to do.
    fn render_steps(
        &self,
        page: u64,
        mut pause: Option<&mut dyn CallbackBridge>,
    ) -> NativeResult<RenderStatus> {
        loop {
            let done = {
                let mut state = self.state.borrow_mut();
                let loaded = state
                    .pages
                    .get_mut(&page)
                    .ok_or_else(|| NativeError::failed("invalid page"))?;
                let progress = loaded
                    .render
                    .as_mut()
                    .ok_or_else(|| NativeError::failed("render was not started"))?;
                progress.steps_done += 1;
                trace!(page, bitmap = progress.bitmap, step = progress.steps_done, "Render step");
                progress.steps_done >= RENDER_STEPS
            };
            if done {
                return Ok(RenderStatus::Done);
            }

            if let Some(bridge) = pause.as_deref_mut() {
                match bridge.invoke(CallbackRequest::NeedToPauseNow)? {
                    CallbackReply::Pause { pause: true } => return Ok(RenderStatus::ToBeContinued),
                    CallbackReply::Pause { pause: false } => {}
                    other => return Err(unexpected_reply("NeedToPauseNow", &other)),
                }
            }
        }
    }
}

fn unexpected_reply(callback: &str, reply: &CallbackReply) -> NativeError {
    NativeError::Callback {
        message: format!("unexpected reply to {}: {:?}", callback, reply),
    }
}

impl NativeLibrary for MemoryLibrary {
    fn name(&self) -> &str {
        "memory"
    }

    fn load_document(&self, data: &[u8], password: Option<&str>) -> NativeResult<u64> {
        let pages = parse_document(data, password)?;
        let document = self.allocate();
        self.state.borrow_mut().documents.insert(
            document,
            Document {
                pages,
                index_page: None,
            },
        );
        Ok(document)
    }

    fn load_document_from_path(&self, path: &Path, password: Option<&str>) -> NativeResult<u64> {
        let data = std::fs::read(path).map_err(|_| NativeError::LastError {
            code: PdfiumErrorCode::FILE,
        })?;
        self.load_document(&data, password)
    }

    fn close_document(&self, document: u64) -> NativeResult<()> {
        let mut state = self.state.borrow_mut();
        state
            .documents
            .remove(&document)
            .ok_or_else(|| NativeError::failed("invalid document"))?;

        let pages: HashSet<u64> = state
            .pages
            .iter()
            .filter(|(_, page)| page.document == document)
            .map(|(native, _)| *native)
            .collect();
        state.pages.retain(|native, _| !pages.contains(native));
        state.annotations.retain(|_, a| !pages.contains(&a.page));
        state.forms.retain(|_, form| form.document != document);
        Ok(())
    }

    fn page_count(&self, document: u64) -> NativeResult<i32> {
        let state = self.state.borrow();
        Ok(state.document(document)?.pages.len() as i32)
    }

    fn load_page(&self, document: u64, index: i32) -> NativeResult<u64> {
        self.open_page(document, index)
    }

    fn close_page(&self, page: u64) -> NativeResult<()> {
        let mut state = self.state.borrow_mut();
        state
            .pages
            .remove(&page)
            .map(|_| ())
            .ok_or_else(|| NativeError::failed("invalid page"))
    }

    fn page_for(&self, page: NativePage) -> NativeResult<u64> {
        match page {
            NativePage::Reference { page } => {
                self.state.borrow().page(page)?;
                Ok(page)
            }
            NativePage::Index { document, index } => {
                let cached = self.state.borrow().document(document)?.index_page;
                match cached {
                    Some((cached_index, page)) if cached_index == index => Ok(page),
                    _ => {
                        let page = self.open_page(document, index)?;
                        let mut state = self.state.borrow_mut();
                        if let Some((_, previous)) = cached {
                            state.pages.remove(&previous);
                        }
                        if let Some(doc) = state.documents.get_mut(&document) {
                            doc.index_page = Some((index, page));
                        }
                        Ok(page)
                    }
                }
            }
        }
    }

    fn page_size(&self, page: u64) -> NativeResult<(f32, f32)> {
        let state = self.state.borrow();
        let data = state.page_data(page)?;
        Ok((data.width, data.height))
    }

    fn load_text_page(&self, page: u64) -> NativeResult<u64> {
        let text = self.state.borrow().page_data(page)?.text.clone();
        let text_page = self.allocate();
        self.state
            .borrow_mut()
            .text_pages
            .insert(text_page, TextPage { text });
        Ok(text_page)
    }

    fn close_text_page(&self, text_page: u64) -> NativeResult<()> {
        self.state
            .borrow_mut()
            .text_pages
            .remove(&text_page)
            .map(|_| ())
            .ok_or_else(|| NativeError::failed("invalid text page"))
    }

    fn count_chars(&self, text_page: u64) -> NativeResult<i32> {
        let state = self.state.borrow();
        let text_page = state
            .text_pages
            .get(&text_page)
            .ok_or_else(|| NativeError::failed("invalid text page"))?;
        Ok(text_page.text.chars().count() as i32)
    }

    fn find_start(
        &self,
        text_page: u64,
        query: &str,
        flags: SearchFlags,
        start_index: i32,
    ) -> NativeResult<u64> {
        if query.is_empty() {
            return Err(NativeError::failed("could not start search"));
        }
        let matches = {
            let state = self.state.borrow();
            let text_page = state
                .text_pages
                .get(&text_page)
                .ok_or_else(|| NativeError::failed("invalid text page"))?;
            find_matches(&text_page.text, query, flags, start_index.max(0) as usize)
        };
        let search = self.allocate();
        self.state
            .borrow_mut()
            .searches
            .insert(search, Search { matches, next: 0 });
        Ok(search)
    }

    fn find_next(&self, search: u64) -> NativeResult<bool> {
        let mut state = self.state.borrow_mut();
        let search = state
            .searches
            .get_mut(&search)
            .ok_or_else(|| NativeError::failed("invalid search"))?;
        if search.next < search.matches.len() {
            search.next += 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn find_close(&self, search: u64) -> NativeResult<()> {
        self.state
            .borrow_mut()
            .searches
            .remove(&search)
            .map(|_| ())
            .ok_or_else(|| NativeError::failed("invalid search"))
    }

    fn create_bitmap(&self, width: i32, height: i32, alpha: bool) -> NativeResult<u64> {
        if width <= 0 || height <= 0 {
            return Err(NativeError::failed("could not create bitmap"));
        }
        let bitmap = self.allocate();
        self.state
            .borrow_mut()
            .bitmaps
            .insert(bitmap, (width, height, alpha));
        Ok(bitmap)
    }

    fn destroy_bitmap(&self, bitmap: u64) -> NativeResult<()> {
        self.state
            .borrow_mut()
            .bitmaps
            .remove(&bitmap)
            .map(|_| ())
            .ok_or_else(|| NativeError::failed("invalid bitmap"))
    }

    fn annotation_count(&self, page: u64) -> NativeResult<i32> {
        let state = self.state.borrow();
        Ok(state.page_data(page)?.annotations.len() as i32)
    }

    fn create_annotation(&self, page: u64, subtype: AnnotationSubtype) -> NativeResult<u64> {
        if !subtype.is_creatable() {
            return Err(NativeError::failed("could not create annotation"));
        }
        self.state
            .borrow_mut()
            .page_data_mut(page)?
            .annotations
            .push(subtype);
        let annotation = self.allocate();
        self.state
            .borrow_mut()
            .annotations
            .insert(annotation, Annotation { page });
        Ok(annotation)
    }

    fn close_annotation(&self, annotation: u64) -> NativeResult<()> {
        self.state
            .borrow_mut()
            .annotations
            .remove(&annotation)
            .map(|_| ())
            .ok_or_else(|| NativeError::failed("invalid annotation"))
    }

    fn remove_annotation(&self, page: u64, index: i32) -> NativeResult<()> {
        let mut state = self.state.borrow_mut();
        let data = state.page_data_mut(page)?;
        match usize::try_from(index) {
            Ok(index) if index < data.annotations.len() => {
                data.annotations.remove(index);
                Ok(())
            }
            _ => Err(NativeError::failed("could not remove annotation")),
        }
    }

    fn render_start(
        &self,
        bitmap: u64,
        page: u64,
        area: RenderArea,
        pause: Option<&mut dyn CallbackBridge>,
    ) -> NativeResult<RenderStatus> {
        {
            let mut state = self.state.borrow_mut();
            if !state.bitmaps.contains_key(&bitmap) {
                return Err(NativeError::failed("invalid bitmap"));
            }
            if area.size_x <= 0 || area.size_y <= 0 {
                return Ok(RenderStatus::Failed);
            }
            let loaded = state
                .pages
                .get_mut(&page)
                .ok_or_else(|| NativeError::failed("invalid page"))?;
            loaded.render = Some(RenderProgress {
                bitmap,
                steps_done: 0,
            });
        }
        self.render_steps(page, pause)
    }

    fn render_continue(
        &self,
        page: u64,
        pause: Option<&mut dyn CallbackBridge>,
    ) -> NativeResult<RenderStatus> {
        let finished = {
            let state = self.state.borrow();
            match &state.page(page)?.render {
                Some(progress) => progress.steps_done >= RENDER_STEPS,
                None => return Ok(RenderStatus::Failed),
            }
        };
        if finished {
            return Ok(RenderStatus::Done);
        }
        self.render_steps(page, pause)
    }

    fn render_close(&self, page: u64) -> NativeResult<()> {
        let mut state = self.state.borrow_mut();
        let loaded = state
            .pages
            .get_mut(&page)
            .ok_or_else(|| NativeError::failed("invalid page"))?;
        loaded.render = None;
        Ok(())
    }

    fn init_form_fill(
        &self,
        document: u64,
        callbacks: &[FormCallbackKind],
        _bridge: &mut dyn CallbackBridge,
    ) -> NativeResult<u64> {
        self.state.borrow().document(document)?;
        let form = self.allocate();
        self.state.borrow_mut().forms.insert(
            form,
            Form {
                document,
                callbacks: callbacks.iter().copied().collect(),
                timers: Vec::new(),
            },
        );
        Ok(form)
    }

    fn exit_form_fill(&self, form: u64, bridge: &mut dyn CallbackBridge) -> NativeResult<()> {
        let form = self
            .state
            .borrow_mut()
            .forms
            .remove(&form)
            .ok_or_else(|| NativeError::failed("invalid form handle"))?;
        for timer_id in form.timers {
            bridge.invoke(CallbackRequest::FormKillTimer { timer_id })?;
        }
        Ok(())
    }

    fn form_on_after_load_page(
        &self,
        page: u64,
        form: u64,
        bridge: &mut dyn CallbackBridge,
    ) -> NativeResult<()> {
        let (document, has_on_change) = {
            let state = self.state.borrow();
            let form = state
                .forms
                .get(&form)
                .ok_or_else(|| NativeError::failed("invalid form handle"))?;
            (
                form.document,
                form.callbacks.contains(&FormCallbackKind::OnChange),
            )
        };
        let (width, height) = self.page_size(page)?;

        match bridge.invoke(CallbackRequest::FormGetCurrentPage { document })? {
            CallbackReply::Page { .. } => {}
            other => return Err(unexpected_reply("FFI_GetCurrentPage", &other)),
        }

        bridge.invoke(CallbackRequest::FormInvalidate {
            page,
            left: 0.0,
            top: f64::from(height),
            right: f64::from(width),
            bottom: 0.0,
        })?;

        let timer_id = match bridge.invoke(CallbackRequest::FormSetTimer {
            elapse_ms: FORM_TIMER_ELAPSE_MS,
        })? {
            CallbackReply::TimerId { timer_id } => timer_id,
            other => return Err(unexpected_reply("FFI_SetTimer", &other)),
        };
        if let Some(form) = self.state.borrow_mut().forms.get_mut(&form) {
            form.timers.push(timer_id);
        }

        if has_on_change {
            bridge.invoke(CallbackRequest::FormOnChange)?;
        }
        Ok(())
    }

    fn default_ttf_map(&self) -> NativeResult<Vec<TtfMapEntry>> {
        Ok(DEFAULT_TTF_MAP
            .iter()
            .map(|(charset, font_name)| TtfMapEntry {
                charset: *charset,
                font_name: font_name.to_string(),
            })
            .collect())
    }
}

const DEFAULT_TTF_MAP: &[(i32, &str)] = &[
    (0, "Helvetica"),
    (128, "MS Gothic"),
    (129, "Batang"),
    (134, "SimSun"),
    (136, "MingLiU"),
    (161, "Tahoma"),
    (162, "Tahoma"),
    (177, "Arial"),
    (178, "Arial"),
    (186, "Arial"),
    (204, "Arial"),
    (222, "Tahoma"),
    (238, "Arial"),
];

fn parse_document(data: &[u8], password: Option<&str>) -> NativeResult<Vec<PageData>> {
    if !data.starts_with(b"%PDF-") {
        return Err(NativeError::LastError {
            code: PdfiumErrorCode::FORMAT,
        });
    }
    let source = String::from_utf8_lossy(data);

    if let Some(encrypt) = source.find("/Encrypt") {
        let expected = source[encrypt..]
            .find("/U (")
            .and_then(|at| read_string(&source[encrypt + at + 3..]));
        if expected.as_deref() != password {
            return Err(NativeError::LastError {
                code: PdfiumErrorCode::PASSWORD,
            });
        }
    }

    let mut pages = Vec::new();
    let mut rest = source.as_ref();
    while let Some(at) = rest.find("/Type /Page") {
        let after = &rest[at + "/Type /Page".len()..];
        rest = after;
        if after.starts_with('s') {
            continue;
        }
        let body = match after.find("endobj") {
            Some(end) => &after[..end],
            None => after,
        };
        let (width, height) = read_media_box(body).unwrap_or(DEFAULT_MEDIA_BOX);
        let text = body
            .find("/Text (")
            .and_then(|at| read_string(&body[at + 6..]))
            .unwrap_or_default();
        pages.push(PageData {
            width,
            height,
            text,
            annotations: Vec::new(),
        });
    }

    Ok(pages)
}

/// Read a literal string starting at its opening parenthesis.
fn read_string(source: &str) -> Option<String> {
    let mut chars = source.strip_prefix('(')?.chars();
    let mut out = String::new();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.push(chars.next()?),
            ')' => return Some(out),
            c => out.push(c),
        }
    }
    None
}

fn read_media_box(body: &str) -> Option<(f32, f32)> {
    let start = body.find("/MediaBox [")? + "/MediaBox [".len();
    let end = start + body[start..].find(']')?;
    let values: Vec<f32> = body[start..end]
        .split_whitespace()
        .filter_map(|v| v.parse().ok())
        .collect();
    match values.as_slice() {
        [x0, y0, x1, y1] => Some((x1 - x0, y1 - y0)),
        _ => None,
    }
}

fn find_matches(text: &str, query: &str, flags: SearchFlags, start: usize) -> Vec<usize> {
    let fold = |s: &str| -> Vec<char> {
        if flags.match_case {
            s.chars().collect()
        } else {
            s.chars().flat_map(char::to_lowercase).collect()
        }
    };
    let haystack = fold(text);
    let needle = fold(query);
    if needle.len() > haystack.len() {
        return Vec::new();
    }

    let is_word = |c: Option<&char>| c.is_some_and(|c| c.is_alphanumeric());
    (start..=haystack.len() - needle.len())
        .filter(|&i| haystack[i..i + needle.len()] == needle[..])
        .filter(|&i| {
            !flags.match_whole_word
                || (!is_word(i.checked_sub(1).and_then(|p| haystack.get(p)))
                    && !is_word(haystack.get(i + needle.len())))
        })
        .collect()
}

/// Build a document the in-memory library can open.
pub fn sample_document(pages: &[&str], password: Option<&str>) -> Vec<u8> {
    fn escape(text: &str) -> String {
        text.replace('\\', "\\\\")
            .replace('(', "\\(")
            .replace(')', "\\)")
    }

    let mut out = String::from("%PDF-1.7\n");
    out.push_str("1 0 obj << /Type /Catalog /Pages 2 0 R >> endobj\n");
    out.push_str(&format!(
        "2 0 obj << /Type /Pages /Count {} >> endobj\n",
        pages.len()
    ));
    for (i, text) in pages.iter().enumerate() {
        out.push_str(&format!(
            "{} 0 obj << /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Text ({}) >> endobj\n",
            i + 3,
            escape(text)
        ));
    }
    if let Some(password) = password {
        out.push_str(&format!(
            "trailer << /Encrypt << /Filter /Standard /U ({}) >> >>\n",
            escape(password)
        ));
    }
    out.push_str("%%EOF\n");
    out.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::NoCallbacks;

    /// Records callbacks and answers them like a caller would.
    #[derive(Default)]
    struct Recorder {
        seen: Vec<CallbackRequest>,
        pause: bool,
    }

    impl CallbackBridge for Recorder {
        fn invoke(&mut self, request: CallbackRequest) -> NativeResult<CallbackReply> {
            let reply = match &request {
                CallbackRequest::NeedToPauseNow => CallbackReply::Pause { pause: self.pause },
                CallbackRequest::FormSetTimer { .. } => CallbackReply::TimerId { timer_id: 7 },
                CallbackRequest::FormGetCurrentPage { .. } => CallbackReply::Page { page: None },
                _ => CallbackReply::Unit,
            };
            self.seen.push(request);
            Ok(reply)
        }
    }

    #[test]
    fn test_load_and_count_pages() {
        let library = MemoryLibrary::new();
        let doc = library
            .load_document(&sample_document(&["one", "two", "three"], None), None)
            .unwrap();
        assert_eq!(library.page_count(doc).unwrap(), 3);

        let page = library.load_page(doc, 1).unwrap();
        assert_eq!(library.page_size(page).unwrap(), (612.0, 792.0));
        assert_eq!(
            library.load_page(doc, 3),
            Err(NativeError::LastError {
                code: PdfiumErrorCode::PAGE
            })
        );
    }

    #[test]
    fn test_rejects_non_pdf() {
        let library = MemoryLibrary::new();
        assert_eq!(
            library.load_document(b"hello", None),
            Err(NativeError::LastError {
                code: PdfiumErrorCode::FORMAT
            })
        );
    }

    #[test]
    fn test_password() {
        let library = MemoryLibrary::new();
        let data = sample_document(&["secret"], Some("s3cr(e)t"));
        assert_eq!(
            library.load_document(&data, None),
            Err(NativeError::LastError {
                code: PdfiumErrorCode::PASSWORD
            })
        );
        assert!(library.load_document(&data, Some("wrong")).is_err());
        assert!(library.load_document(&data, Some("s3cr(e)t")).is_ok());
    }

    #[test]
    fn test_missing_file() {
        let library = MemoryLibrary::new();
        assert_eq!(
            library.load_document_from_path(Path::new("/nonexistent/file.pdf"), None),
            Err(NativeError::LastError {
                code: PdfiumErrorCode::FILE
            })
        );
    }

    #[test]
    fn test_text_search() {
        let library = MemoryLibrary::new();
        let doc = library
            .load_document(&sample_document(&["The cat sat on the catalog"], None), None)
            .unwrap();
        let page = library.load_page(doc, 0).unwrap();
        let text = library.load_text_page(page).unwrap();
        assert_eq!(library.count_chars(text).unwrap(), 26);

        let search = library
            .find_start(text, "CAT", SearchFlags::default(), 0)
            .unwrap();
        assert!(library.find_next(search).unwrap());
        assert!(library.find_next(search).unwrap());
        assert!(!library.find_next(search).unwrap());
        library.find_close(search).unwrap();

        let whole_word = SearchFlags {
            match_case: false,
            match_whole_word: true,
        };
        let search = library.find_start(text, "cat", whole_word, 0).unwrap();
        assert!(library.find_next(search).unwrap());
        assert!(!library.find_next(search).unwrap());
    }

    #[test]
    fn test_annotation_remove_twice() {
        let library = MemoryLibrary::new();
        let doc = library
            .load_document(&sample_document(&["annotated"], None), None)
            .unwrap();
        let page = library.load_page(doc, 0).unwrap();
        library
            .create_annotation(page, AnnotationSubtype::Highlight)
            .unwrap();
        assert_eq!(library.annotation_count(page).unwrap(), 1);

        library.remove_annotation(page, 0).unwrap();
        assert_eq!(
            library.remove_annotation(page, 0),
            Err(NativeError::failed("could not remove annotation"))
        );
        assert!(
            library
                .create_annotation(page, AnnotationSubtype::Widget)
                .is_err()
        );
    }

    #[test]
    fn test_progressive_render_with_pause() {
        let library = MemoryLibrary::new();
        let doc = library
            .load_document(&sample_document(&["render me"], None), None)
            .unwrap();
        let page = library.load_page(doc, 0).unwrap();
        let bitmap = library.create_bitmap(100, 100, false).unwrap();
        let area = RenderArea {
            start_x: 0,
            start_y: 0,
            size_x: 100,
            size_y: 100,
            rotate: 0,
            flags: 0,
        };

        let mut pauser = Recorder {
            pause: true,
            ..Recorder::default()
        };
        assert_eq!(
            library.render_start(bitmap, page, area, Some(&mut pauser)),
            Ok(RenderStatus::ToBeContinued)
        );
        assert_eq!(
            library.render_continue(page, Some(&mut pauser)),
            Ok(RenderStatus::ToBeContinued)
        );
        assert_eq!(
            library.render_continue(page, Some(&mut pauser)),
            Ok(RenderStatus::Done)
        );
        assert_eq!(pauser.seen.len(), 2);
        library.render_close(page).unwrap();

        // Without a pause callback the render runs to completion
        assert_eq!(
            library.render_start(bitmap, page, area, None),
            Ok(RenderStatus::Done)
        );
    }

    #[test]
    fn test_form_callbacks_fire_in_order() {
        let library = MemoryLibrary::new();
        let doc = library
            .load_document(&sample_document(&["form"], None), None)
            .unwrap();
        let page = library.load_page(doc, 0).unwrap();
        let mut recorder = Recorder::default();

        let mut callbacks = FormCallbackKind::REQUIRED.to_vec();
        callbacks.push(FormCallbackKind::OnChange);
        let form = library
            .init_form_fill(doc, &callbacks, &mut recorder)
            .unwrap();
        library
            .form_on_after_load_page(page, form, &mut recorder)
            .unwrap();
        library.exit_form_fill(form, &mut recorder).unwrap();

        let order: Vec<_> = recorder
            .seen
            .iter()
            .filter_map(CallbackRequest::form_callback)
            .collect();
        assert_eq!(
            order,
            vec![
                FormCallbackKind::GetCurrentPage,
                FormCallbackKind::Invalidate,
                FormCallbackKind::SetTimer,
                FormCallbackKind::OnChange,
                FormCallbackKind::KillTimer,
            ]
        );
    }

    #[test]
    fn test_callback_failure_propagates() {
        let library = MemoryLibrary::new();
        let doc = library
            .load_document(&sample_document(&["form"], None), None)
            .unwrap();
        let page = library.load_page(doc, 0).unwrap();
        let form = library
            .init_form_fill(doc, &FormCallbackKind::REQUIRED, &mut NoCallbacks)
            .unwrap();
        assert!(matches!(
            library.form_on_after_load_page(page, form, &mut NoCallbacks),
            Err(NativeError::Callback { .. })
        ));
    }

    #[test]
    fn test_index_pages_are_reused() {
        let library = MemoryLibrary::new();
        let doc = library
            .load_document(&sample_document(&["a", "b"], None), None)
            .unwrap();
        let first = library
            .page_for(NativePage::Index {
                document: doc,
                index: 0,
            })
            .unwrap();
        let again = library
            .page_for(NativePage::Index {
                document: doc,
                index: 0,
            })
            .unwrap();
        assert_eq!(first, again);

        let second = library
            .page_for(NativePage::Index {
                document: doc,
                index: 1,
            })
            .unwrap();
        assert_ne!(first, second);
        // The previously cached page was released
        assert!(library.page_size(first).is_err());
    }

    #[test]
    fn test_two_instances_are_independent() {
        let a = MemoryLibrary::new();
        let b = MemoryLibrary::new();
        let data = sample_document(&["x"], None);
        let doc_a = a.load_document(&data, None).unwrap();
        let doc_b = b.load_document(&data, None).unwrap();
        assert_eq!(doc_a, doc_b);

        a.close_document(doc_a).unwrap();
        assert!(a.page_count(doc_a).is_err());
        assert_eq!(b.page_count(doc_b).unwrap(), 1);
        assert_eq!(a.default_ttf_map().unwrap().len(), DEFAULT_TTF_MAP.len());
    }
}
