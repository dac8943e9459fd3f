//! Process signal handling: lets the guidance flush its stats writers and
//! report a final event when the campaign is interrupted.

static mut SIGNAL_HANDLER: Option<Box<dyn Fn(libc::c_int)>> = None;

const HANDLED_SIGNALS: [libc::c_int; 2] = [libc::SIGINT, libc::SIGTERM];

extern "C" fn os_handler(signal: libc::c_int) {
    // Assuming this always succeeds. Can't really handle errors in any meaningful way.
    unsafe {
        reset_signal_handlers();
        if let Some(handler) = SIGNAL_HANDLER.as_ref() {
            handler(signal);
        } else {
            std::process::exit(1);
        }
    }
}

/// Installs `f` as the handler for interruption signals.
///
/// # Safety
/// The closure outlives every borrow it captures: callers pass a raw pointer
/// to state that stays alive until the process exits.
pub(crate) unsafe fn set_signal_handlers<F>(f: F)
where
    F: Fn(libc::c_int) + 'static,
{
    SIGNAL_HANDLER = Some(Box::new(f));
    let mut action: libc::sigaction = std::mem::zeroed();
    action.sa_sigaction = os_handler as libc::sighandler_t;
    libc::sigemptyset(&mut action.sa_mask);
    for &signal in &HANDLED_SIGNALS {
        if libc::sigaction(signal, &action, std::ptr::null_mut()) != 0 {
            panic!("could not register handler for signal {}", signal);
        }
    }
}

unsafe fn reset_signal_handlers() {
    let mut action: libc::sigaction = std::mem::zeroed();
    action.sa_sigaction = libc::SIG_DFL;
    libc::sigemptyset(&mut action.sa_mask);
    for &signal in &HANDLED_SIGNALS {
        let _ = libc::sigaction(signal, &action, std::ptr::null_mut());
    }
}
