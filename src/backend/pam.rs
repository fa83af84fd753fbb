//! Linux-PAM backend
//!
//! Built on the `pam-sys` bindings. The conversation callback receives a
//! pointer to a slot owned by the transaction; the slot points at the
//! caller's [`ConversationBridge`] only while `pam_authenticate` and
//! `pam_acct_mgmt` run.

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_void};
use std::ptr;

use pam_sys::raw;
use pam_sys::{PamConversation, PamFlag, PamHandle, PamMessage, PamResponse, PamReturnCode};
use tracing::{debug, info, warn};

use super::{AuthBackend, BackendStatus, BackendTransaction, SessionRecord};
use crate::auth::{Answer, ConversationBridge, ConversationError, ConversationMessage, Identity};

/// Bridge pointer shared with the C callback. Null outside of a phase.
struct ConversationSlot {
    bridge: *const ConversationBridge<'static>,
}

/// PAM authentication backend
pub struct PamBackend {
    service: CString,
}

impl PamBackend {
    /// Create backend for a PAM service (e.g. "login")
    pub fn new(service_name: &str) -> anyhow::Result<Self> {
        let service = CString::new(service_name)
            .map_err(|_| anyhow::anyhow!("PAM service name contains a NUL byte"))?;

        info!("Initializing PAM backend with service: {}", service_name);

        Ok(Self { service })
    }
}

impl AuthBackend for PamBackend {
    fn start(&self, username: &str) -> Result<Box<dyn BackendTransaction + '_>, BackendStatus> {
        let transaction = PamTransaction::start(&self.service, username)?;
        Ok(Box::new(transaction))
    }

    fn open_session(&self, identity: &Identity) -> Result<Box<dyn SessionRecord>, BackendStatus> {
        let mut transaction = PamTransaction::start(&self.service, &identity.username)?;

        // SAFETY: handle is valid until finish()
        let status = BackendStatus::from_code(unsafe {
            raw::pam_setcred(transaction.handle, PamFlag::ESTABLISH_CRED as c_int)
        });
        if !status.is_success() {
            warn!("pam_setcred failed for {}: {:?}", identity.username, status);
            transaction.finish(status);
            return Err(status);
        }

        // SAFETY: handle is valid until finish()
        let status =
            BackendStatus::from_code(unsafe { raw::pam_open_session(transaction.handle, PamFlag::NONE as c_int) });
        if !status.is_success() {
            warn!("pam_open_session failed for {}: {:?}", identity.username, status);
            // SAFETY: credentials were established above
            unsafe { raw::pam_setcred(transaction.handle, PamFlag::DELETE_CRED as c_int) };
            transaction.finish(status);
            return Err(status);
        }

        let environment = transaction.environment();
        debug!(
            "PAM session opened for {} ({} environment entries)",
            identity.username,
            environment.len()
        );

        Ok(Box::new(PamSession {
            transaction,
            environment,
        }))
    }
}

/// One pam_start..pam_end lifetime
struct PamTransaction {
    handle: *mut PamHandle,
    slot: Box<ConversationSlot>,
    // pam_start copies the struct, kept alive anyway for the handle's lifetime
    _conv: Box<PamConversation>,
    last_status: BackendStatus,
}

// The handle is only ever used by the thread that currently owns the value.
unsafe impl Send for PamTransaction {}

impl PamTransaction {
    fn start(service: &CStr, username: &str) -> Result<Self, BackendStatus> {
        let user = CString::new(username).map_err(|_| BackendStatus::UserUnknown)?;

        let mut slot = Box::new(ConversationSlot { bridge: ptr::null() });
        let conv = Box::new(PamConversation {
            conv: Some(converse),
            data_ptr: (&mut *slot as *mut ConversationSlot).cast::<c_void>(),
        });

        let mut handle: *mut PamHandle = ptr::null_mut();
        // SAFETY: all pointers are valid NUL-terminated strings / live boxes
        let code = unsafe { raw::pam_start(service.as_ptr(), user.as_ptr(), &*conv, (&mut handle as *mut *mut PamHandle).cast::<*const PamHandle>()) };
        let status = BackendStatus::from_code(code);

        if !status.is_success() || handle.is_null() {
            warn!("pam_start failed: {:?}", status);
            return Err(if status.is_success() {
                BackendStatus::SystemError
            } else {
                status
            });
        }

        Ok(Self {
            handle,
            slot,
            _conv: conv,
            last_status: BackendStatus::Success,
        })
    }

    /// Run one PAM call with the bridge reachable from the callback
    fn with_bridge(
        &mut self,
        bridge: &ConversationBridge<'_>,
        call: unsafe extern "C" fn(*mut PamHandle, c_int) -> c_int,
    ) -> BackendStatus {
        self.slot.bridge = (bridge as *const ConversationBridge<'_>).cast();
        // SAFETY: handle is live; the slot outlives the call and is cleared after
        let code = unsafe { call(self.handle, PamFlag::NONE as c_int) };
        self.slot.bridge = ptr::null();

        self.last_status = BackendStatus::from_code(code);
        self.last_status
    }

    /// Environment list set up by the session modules
    fn environment(&self) -> Vec<(String, String)> {
        let mut environment = Vec::new();

        // SAFETY: handle is live; the list and its strings are malloc'd and ours to free
        unsafe {
            let list = raw::pam_getenvlist(self.handle);
            if list.is_null() {
                return environment;
            }

            let mut cursor = list;
            while !(*cursor).is_null() {
                let entry = CStr::from_ptr(*cursor).to_string_lossy().into_owned();
                if let Some((name, value)) = entry.split_once('=') {
                    environment.push((name.to_string(), value.to_string()));
                }
                libc::free((*cursor).cast_mut().cast());
                cursor = cursor.add(1);
            }
            libc::free(list.cast_mut().cast());
        }

        environment
    }

    fn finish(&mut self, status: BackendStatus) {
        if self.handle.is_null() {
            return;
        }
        // SAFETY: handle is live and never used again
        unsafe { raw::pam_end(self.handle, status.code()) };
        self.handle = ptr::null_mut();
    }
}

impl BackendTransaction for PamTransaction {
    fn verify_credential(&mut self, bridge: &ConversationBridge<'_>) -> BackendStatus {
        self.with_bridge(bridge, raw::pam_authenticate)
    }

    fn check_account(&mut self, bridge: &ConversationBridge<'_>) -> BackendStatus {
        self.with_bridge(bridge, raw::pam_acct_mgmt)
    }

    fn end(mut self: Box<Self>, status: BackendStatus) {
        self.finish(status);
    }
}

impl Drop for PamTransaction {
    fn drop(&mut self) {
        let status = self.last_status;
        self.finish(status);
    }
}

/// Open PAM login session
struct PamSession {
    transaction: PamTransaction,
    environment: Vec<(String, String)>,
}

impl PamSession {
    fn close_inner(&mut self) {
        if self.transaction.handle.is_null() {
            return;
        }
        // SAFETY: handle is live; session and credentials were opened in open_session
        let status = unsafe {
            let status = raw::pam_close_session(self.transaction.handle, PamFlag::NONE as c_int);
            raw::pam_setcred(self.transaction.handle, PamFlag::DELETE_CRED as c_int);
            BackendStatus::from_code(status)
        };
        if !status.is_success() {
            warn!("pam_close_session failed: {:?}", status);
        }
        self.transaction.finish(status);
    }
}

impl SessionRecord for PamSession {
    fn environment(&self) -> &[(String, String)] {
        &self.environment
    }

    fn close(mut self: Box<Self>) {
        self.close_inner();
    }
}

impl Drop for PamSession {
    fn drop(&mut self) {
        self.close_inner();
    }
}

const SUCCESS: c_int = PamReturnCode::SUCCESS as c_int;
const BUF_ERR: c_int = PamReturnCode::BUF_ERR as c_int;
const CONV_ERR: c_int = PamReturnCode::CONV_ERR as c_int;

extern "C" fn converse(
    num_msg: c_int,
    msg: *mut *mut PamMessage,
    resp: *mut *mut PamResponse,
    appdata_ptr: *mut c_void,
) -> c_int {
    if num_msg <= 0 || msg.is_null() || resp.is_null() || appdata_ptr.is_null() {
        return CONV_ERR;
    }

    // SAFETY: appdata_ptr is the ConversationSlot boxed by PamTransaction::start
    let slot = unsafe { &*appdata_ptr.cast::<ConversationSlot>() };
    if slot.bridge.is_null() {
        // Modules conversing outside a credential phase get nothing
        return CONV_ERR;
    }
    // SAFETY: non-null only while with_bridge() holds the borrow
    let bridge = unsafe { &*slot.bridge };

    // SAFETY: PAM passes num_msg valid message pointers
    let batch = match unsafe { decode_batch(msg, num_msg as usize) } {
        Ok(batch) => batch,
        Err(e) => {
            warn!("PAM conversation aborted: {}", e);
            return CONV_ERR;
        }
    };

    let answers = match bridge.respond(&batch) {
        Ok(answers) => answers,
        Err(ConversationError::Allocation) => return BUF_ERR,
        Err(e) => {
            warn!("PAM conversation aborted: {}", e);
            return CONV_ERR;
        }
    };

    // SAFETY: PAM takes ownership of the array and its strings
    match unsafe { build_responses(&batch, &answers) } {
        Ok(responses) => {
            // SAFETY: resp checked non-null above
            unsafe { *resp = responses };
            SUCCESS
        }
        Err(code) => code,
    }
}

/// Decode `count` PAM messages into a conversation batch
unsafe fn decode_batch(
    msg: *mut *mut PamMessage,
    count: usize,
) -> Result<Vec<ConversationMessage>, ConversationError> {
    let mut batch = Vec::with_capacity(count);
    for i in 0..count {
        // SAFETY: caller guarantees count valid message pointers
        let message = unsafe { &**msg.add(i) };
        let text = if message.msg.is_null() {
            String::new()
        } else {
            // SAFETY: PAM message text is NUL-terminated
            unsafe { CStr::from_ptr(message.msg) }
                .to_string_lossy()
                .into_owned()
        };
        batch.push(ConversationMessage::from_style(message.msg_style, text)?);
    }
    Ok(batch)
}

/// calloc'd response array with each answer in its prompt's slot
///
/// Non-prompt slots stay null. On failure nothing is left allocated.
unsafe fn build_responses(
    batch: &[ConversationMessage],
    answers: &[Answer],
) -> Result<*mut PamResponse, c_int> {
    let count = batch.len();

    // SAFETY: calloc result is checked before use
    unsafe {
        let responses =
            libc::calloc(count, std::mem::size_of::<PamResponse>()).cast::<PamResponse>();
        if responses.is_null() {
            return Err(BUF_ERR);
        }

        let mut answers = answers.iter();
        for (i, message) in batch.iter().enumerate() {
            if !message.is_prompt() {
                continue;
            }
            let Some(answer) = answers.next() else {
                free_responses(responses, count);
                return Err(CONV_ERR);
            };
            let copy = copy_answer(answer.expose());
            if copy.is_null() {
                free_responses(responses, count);
                return Err(BUF_ERR);
            }
            (*responses.add(i)).resp = copy;
        }

        Ok(responses)
    }
}

/// malloc'd NUL-terminated copy of an answer, null on failure
unsafe fn copy_answer(answer: &str) -> *mut c_char {
    let bytes = answer.as_bytes();
    if bytes.contains(&0) {
        return ptr::null_mut();
    }
    // SAFETY: buffer is len + 1 bytes and fully written before use
    unsafe {
        let buffer = libc::malloc(bytes.len() + 1).cast::<u8>();
        if buffer.is_null() {
            return ptr::null_mut();
        }
        ptr::copy_nonoverlapping(bytes.as_ptr(), buffer, bytes.len());
        *buffer.add(bytes.len()) = 0;
        buffer.cast()
    }
}

/// Zero and free a response array
unsafe fn free_responses(responses: *mut PamResponse, count: usize) {
    // SAFETY: responses came from calloc(count) and holds malloc'd strings or null
    unsafe {
        for i in 0..count {
            let entry = &mut *responses.add(i);
            if !entry.resp.is_null() {
                let len = libc::strlen(entry.resp);
                ptr::write_bytes(entry.resp, 0, len);
                libc::free(entry.resp.cast());
            }
        }
        libc::free(responses.cast());
    }
}
