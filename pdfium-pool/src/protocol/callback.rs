//! Callbacks raised by the native side while a call is in flight.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Form-fill callbacks a caller can register.
///
/// Variant order is the order in which `init_form_fill_environment` checks
/// that the required ones are present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FormCallbackKind {
    Invalidate,
    SetCursor,
    SetTimer,
    KillTimer,
    GetLocalTime,
    GetPage,
    GetCurrentPage,
    GetRotation,
    ExecuteNamedAction,
    OnChange,
}

impl FormCallbackKind {
    /// Callbacks without which the form environment cannot be created.
    pub const REQUIRED: [FormCallbackKind; 9] = [
        FormCallbackKind::Invalidate,
        FormCallbackKind::SetCursor,
        FormCallbackKind::SetTimer,
        FormCallbackKind::KillTimer,
        FormCallbackKind::GetLocalTime,
        FormCallbackKind::GetPage,
        FormCallbackKind::GetCurrentPage,
        FormCallbackKind::GetRotation,
        FormCallbackKind::ExecuteNamedAction,
    ];

    /// Name of the `FPDF_FORMFILLINFO` member this callback fills.
    pub fn ffi_name(&self) -> &'static str {
        match self {
            FormCallbackKind::Invalidate => "FFI_Invalidate",
            FormCallbackKind::SetCursor => "FFI_SetCursor",
            FormCallbackKind::SetTimer => "FFI_SetTimer",
            FormCallbackKind::KillTimer => "FFI_KillTimer",
            FormCallbackKind::GetLocalTime => "FFI_GetLocalTime",
            FormCallbackKind::GetPage => "FFI_GetPage",
            FormCallbackKind::GetCurrentPage => "FFI_GetCurrentPage",
            FormCallbackKind::GetRotation => "FFI_GetRotation",
            FormCallbackKind::ExecuteNamedAction => "FFI_ExecuteNamedAction",
            FormCallbackKind::OnChange => "FFI_OnChange",
        }
    }
}

/// Wall clock as reported to `FFI_GetLocalTime`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalTime {
    pub year: u16,
    pub month: u16,
    pub day_of_week: u16,
    pub day: u16,
    pub hour: u16,
    pub minute: u16,
    pub second: u16,
    pub milliseconds: u16,
}

/// A callback request carrying native values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "callback", rename_all = "snake_case")]
pub enum CallbackRequest {
    /// `IFSDK_PAUSE::NeedToPauseNow`
    NeedToPauseNow,
    FormInvalidate {
        page: u64,
        left: f64,
        top: f64,
        right: f64,
        bottom: f64,
    },
    FormSetCursor {
        cursor: i32,
    },
    FormSetTimer {
        elapse_ms: i32,
    },
    FormKillTimer {
        timer_id: i32,
    },
    FormGetLocalTime,
    FormGetPage {
        document: u64,
        index: i32,
    },
    FormGetCurrentPage {
        document: u64,
    },
    FormGetRotation {
        page: u64,
    },
    FormExecuteNamedAction {
        name: String,
    },
    FormOnChange,
}

impl CallbackRequest {
    /// Form callback this request is routed to, `None` for the pause check.
    pub fn form_callback(&self) -> Option<FormCallbackKind> {
        match self {
            CallbackRequest::NeedToPauseNow => None,
            CallbackRequest::FormInvalidate { .. } => Some(FormCallbackKind::Invalidate),
            CallbackRequest::FormSetCursor { .. } => Some(FormCallbackKind::SetCursor),
            CallbackRequest::FormSetTimer { .. } => Some(FormCallbackKind::SetTimer),
            CallbackRequest::FormKillTimer { .. } => Some(FormCallbackKind::KillTimer),
            CallbackRequest::FormGetLocalTime => Some(FormCallbackKind::GetLocalTime),
            CallbackRequest::FormGetPage { .. } => Some(FormCallbackKind::GetPage),
            CallbackRequest::FormGetCurrentPage { .. } => Some(FormCallbackKind::GetCurrentPage),
            CallbackRequest::FormGetRotation { .. } => Some(FormCallbackKind::GetRotation),
            CallbackRequest::FormExecuteNamedAction { .. } => {
                Some(FormCallbackKind::ExecuteNamedAction)
            }
            CallbackRequest::FormOnChange => Some(FormCallbackKind::OnChange),
        }
    }
}

/// Reply to a [`CallbackRequest`], with handles already mapped back to
/// native values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum CallbackReply {
    Unit,
    Pause { pause: bool },
    TimerId { timer_id: i32 },
    LocalTime { time: LocalTime },
    Page { page: Option<u64> },
    Rotation { rotation: i32 },
}
