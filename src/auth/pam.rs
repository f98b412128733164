//! Linux-PAM binding
//!
//! libpam is opened at runtime with libloading, so the binary has no link
//! time dependency on it. Only the calls needed for a headless login are
//! bound.

use std::borrow::Cow;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_void};
use std::ptr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use libloading::Library;
use log::{debug, warn};

use super::{AuthBackend, AuthHandle, Conversation, MessageStyle};

const PAM_SUCCESS: c_int = 0;
const PAM_BUF_ERR: c_int = 5;
const PAM_CONV_ERR: c_int = 19;

const PAM_SILENT: c_int = 0x8000;
const PAM_ESTABLISH_CRED: c_int = 0x0002;
const PAM_TTY: c_int = 3;

const PAM_PROMPT_ECHO_OFF: c_int = 1;
const PAM_PROMPT_ECHO_ON: c_int = 2;
const PAM_ERROR_MSG: c_int = 3;
const PAM_TEXT_INFO: c_int = 4;

#[repr(C)]
struct PamMessage {
    msg_style: c_int,
    msg: *const c_char,
}

#[repr(C)]
struct PamResponse {
    resp: *mut c_char,
    resp_retcode: c_int,
}

type ConvFn =
    unsafe extern "C" fn(c_int, *mut *const PamMessage, *mut *mut PamResponse, *mut c_void) -> c_int;

#[repr(C)]
struct PamConv {
    conv: Option<ConvFn>,
    appdata_ptr: *mut c_void,
}

/// Opaque pam_handle_t
#[repr(C)]
struct PamHandleT {
    _private: [u8; 0],
}

type StartFn = unsafe extern "C" fn(*const c_char, *const c_char, *const PamConv, *mut *mut PamHandleT) -> c_int;
type FlagFn = unsafe extern "C" fn(*mut PamHandleT, c_int) -> c_int;
type PutenvFn = unsafe extern "C" fn(*mut PamHandleT, *const c_char) -> c_int;
type GetenvlistFn = unsafe extern "C" fn(*mut PamHandleT) -> *mut *mut c_char;
type SetItemFn = unsafe extern "C" fn(*mut PamHandleT, c_int, *const c_void) -> c_int;
type StrerrorFn = unsafe extern "C" fn(*mut PamHandleT, c_int) -> *const c_char;

struct PamLibrary {
    start: StartFn,
    end: FlagFn,
    authenticate: FlagFn,
    setcred: FlagFn,
    open_session: FlagFn,
    close_session: FlagFn,
    putenv: PutenvFn,
    getenvlist: GetenvlistFn,
    set_item: SetItemFn,
    strerror: StrerrorFn,
    /// Keeps the function pointers above valid
    _lib: Library,
}

unsafe fn symbol<T: Copy>(lib: &Library, name: &str) -> Result<T> {
    let sym: libloading::Symbol<T> = lib
        .get(name.as_bytes())
        .with_context(|| format!("libpam has no symbol {}", name))?;
    Ok(*sym)
}

impl PamLibrary {
    fn load() -> Result<Self> {
        unsafe {
            let lib = Library::new("libpam.so.0")
                .or_else(|_| Library::new("libpam.so"))
                .context("Failed to load PAM library")?;
            Ok(Self {
                start: symbol(&lib, "pam_start")?,
                end: symbol(&lib, "pam_end")?,
                authenticate: symbol(&lib, "pam_authenticate")?,
                setcred: symbol(&lib, "pam_setcred")?,
                open_session: symbol(&lib, "pam_open_session")?,
                close_session: symbol(&lib, "pam_close_session")?,
                putenv: symbol(&lib, "pam_putenv")?,
                getenvlist: symbol(&lib, "pam_getenvlist")?,
                set_item: symbol(&lib, "pam_set_item")?,
                strerror: symbol(&lib, "pam_strerror")?,
                _lib: lib,
            })
        }
    }

    fn error_string(&self, handle: *mut PamHandleT, code: c_int) -> String {
        let msg = unsafe { (self.strerror)(handle, code) };
        if msg.is_null() {
            format!("PAM error {}", code)
        } else {
            unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned()
        }
    }
}

/// [`AuthBackend`] backed by the system's libpam
pub struct PamBackend {
    lib: Arc<PamLibrary>,
}

impl PamBackend {
    pub fn load() -> Result<Self> {
        let lib = PamLibrary::load()?;
        debug!("PAM library loaded");
        Ok(Self { lib: Arc::new(lib) })
    }
}

impl AuthBackend for PamBackend {
    fn begin(
        &self,
        service: &str,
        username: &str,
        conversation: Conversation,
    ) -> Result<Box<dyn AuthHandle>> {
        let service_c = CString::new(service).context("service name contains NUL")?;
        let user_c = CString::new(username).context("user name contains NUL")?;

        // Boxed so the appdata pointer stays valid while the handle lives
        let conversation = Box::new(conversation);
        let conv = PamConv {
            conv: Some(converse),
            appdata_ptr: &*conversation as *const Conversation as *mut c_void,
        };

        let mut handle: *mut PamHandleT = ptr::null_mut();
        let ret = unsafe { (self.lib.start)(service_c.as_ptr(), user_c.as_ptr(), &conv, &mut handle) };
        if ret != PAM_SUCCESS || handle.is_null() {
            return Err(anyhow!(
                "pam_start({}, {}) failed: {}",
                service,
                username,
                self.lib.error_string(handle, ret)
            ));
        }

        Ok(Box::new(PamHandle {
            lib: Arc::clone(&self.lib),
            handle,
            status: PAM_SUCCESS,
            _conversation: conversation,
        }))
    }
}

struct PamHandle {
    lib: Arc<PamLibrary>,
    handle: *mut PamHandleT,
    /// Last return code, handed to pam_end
    status: c_int,
    _conversation: Box<Conversation>,
}

impl PamHandle {
    fn check(&mut self, ret: c_int, what: &str) -> Result<()> {
        self.status = ret;
        if ret == PAM_SUCCESS {
            Ok(())
        } else {
            Err(anyhow!("{}: {}", what, self.lib.error_string(self.handle, ret)))
        }
    }
}

impl AuthHandle for PamHandle {
    fn authenticate(&mut self) -> Result<()> {
        let ret = unsafe { (self.lib.authenticate)(self.handle, PAM_SILENT) };
        self.check(ret, "pam_authenticate")
    }

    fn establish_credentials(&mut self) -> Result<()> {
        let ret = unsafe { (self.lib.setcred)(self.handle, PAM_ESTABLISH_CRED) };
        self.check(ret, "pam_setcred")
    }

    fn open_session(&mut self) -> Result<()> {
        let ret = unsafe { (self.lib.open_session)(self.handle, PAM_SILENT) };
        self.check(ret, "pam_open_session")
    }

    fn close_session(&mut self) -> Result<()> {
        let ret = unsafe { (self.lib.close_session)(self.handle, PAM_SILENT) };
        self.check(ret, "pam_close_session")
    }

    fn putenv(&mut self, key: &str, value: &str) -> Result<()> {
        let pair = CString::new(format!("{}={}", key, value)).context("variable contains NUL")?;
        let ret = unsafe { (self.lib.putenv)(self.handle, pair.as_ptr()) };
        self.check(ret, "pam_putenv")
    }

    fn set_tty(&mut self, tty: &str) -> Result<()> {
        let tty_c = CString::new(tty).context("tty contains NUL")?;
        // pam_set_item copies the string
        let ret = unsafe { (self.lib.set_item)(self.handle, PAM_TTY, tty_c.as_ptr() as *const c_void) };
        self.check(ret, "pam_set_item(PAM_TTY)")
    }

    fn environment(&self) -> Vec<(String, String)> {
        let mut vars = Vec::new();
        let list = unsafe { (self.lib.getenvlist)(self.handle) };
        if list.is_null() {
            return vars;
        }
        unsafe {
            let mut i = 0;
            loop {
                let entry = *list.add(i);
                if entry.is_null() {
                    break;
                }
                let pair = CStr::from_ptr(entry).to_string_lossy();
                if let Some((key, value)) = pair.split_once('=') {
                    vars.push((key.to_string(), value.to_string()));
                }
                libc::free(entry as *mut c_void);
                i += 1;
            }
            libc::free(list as *mut c_void);
        }
        vars
    }
}

impl Drop for PamHandle {
    fn drop(&mut self) {
        let ret = unsafe { (self.lib.end)(self.handle, self.status) };
        if ret != PAM_SUCCESS {
            warn!("pam_end failed: {}", ret);
        }
    }
}

impl MessageStyle {
    fn from_raw(style: c_int) -> Option<Self> {
        match style {
            PAM_PROMPT_ECHO_OFF => Some(MessageStyle::PromptEchoOff),
            PAM_PROMPT_ECHO_ON => Some(MessageStyle::PromptEchoOn),
            PAM_ERROR_MSG => Some(MessageStyle::ErrorMsg),
            PAM_TEXT_INFO => Some(MessageStyle::TextInfo),
            _ => None,
        }
    }
}

/// malloc'd copy of `s`; PAM releases responses with free()
unsafe fn malloc_str(s: &str) -> *mut c_char {
    let bytes = s.as_bytes();
    let buf = libc::malloc(bytes.len() + 1) as *mut c_char;
    if !buf.is_null() {
        ptr::copy_nonoverlapping(bytes.as_ptr() as *const c_char, buf, bytes.len());
        *buf.add(bytes.len()) = 0;
    }
    buf
}

unsafe fn free_responses(responses: *mut PamResponse, count: usize) {
    for i in 0..count {
        let reply = &mut *responses.add(i);
        if !reply.resp.is_null() {
            libc::free(reply.resp as *mut c_void);
        }
    }
    libc::free(responses as *mut c_void);
}

unsafe extern "C" fn converse(
    num_msg: c_int,
    msg: *mut *const PamMessage,
    resp: *mut *mut PamResponse,
    appdata: *mut c_void,
) -> c_int {
    if num_msg <= 0 || msg.is_null() || resp.is_null() || appdata.is_null() {
        return PAM_CONV_ERR;
    }
    let conversation = &*(appdata as *const Conversation);
    let count = num_msg as usize;

    let responses = libc::calloc(count, std::mem::size_of::<PamResponse>()) as *mut PamResponse;
    if responses.is_null() {
        return PAM_BUF_ERR;
    }

    for i in 0..count {
        let message = *msg.add(i);
        if message.is_null() {
            continue;
        }
        let text = if (*message).msg.is_null() {
            Cow::Borrowed("")
        } else {
            CStr::from_ptr((*message).msg).to_string_lossy()
        };
        let answer = MessageStyle::from_raw((*message).msg_style)
            .and_then(|style| conversation.respond(style, &text));

        if let Some(answer) = answer {
            let copy = malloc_str(&answer);
            if copy.is_null() {
                free_responses(responses, count);
                return PAM_BUF_ERR;
            }
            (*responses.add(i)).resp = copy;
        }
    }

    *resp = responses;
    PAM_SUCCESS
}
