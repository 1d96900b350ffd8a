use std::sync::OnceLock;

use gitbackup_core::CancelToken;

static TOKEN: OnceLock<CancelToken> = OnceLock::new();

/// Install SIGINT/SIGTERM handlers that trip the cancellation token.
///
/// The first signal cancels cooperatively and restores the default handler,
/// so a second signal terminates immediately.
pub fn install(token: &CancelToken) {
    let _ = TOKEN.set(token.clone());

    #[cfg(unix)]
    {
        // Safety: the handler only performs an atomic store and restores the
        // default disposition.
        unsafe {
            libc::signal(
                libc::SIGTERM,
                unix_signal_handler as *const () as libc::sighandler_t,
            );
            libc::signal(
                libc::SIGINT,
                unix_signal_handler as *const () as libc::sighandler_t,
            );
        }
    }
}

#[cfg(unix)]
extern "C" fn unix_signal_handler(sig: libc::c_int) {
    if let Some(token) = TOKEN.get() {
        token.cancel();
    }
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
    }
}
