//! Signal handling: Ctrl+C cancels the run, a second Ctrl+C hard-exits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use anyhow::Result;
use tokio_util::sync::CancellationToken;

/// Global interrupt flag, registered once with SIGINT.
static INTERRUPT_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

/// Register the SIGINT handlers and bridge the first interrupt onto
/// `interrupt`. Safe to call multiple times; only the first call registers
/// the OS handlers.
///
/// Handler order matters: the hard-exit check runs before the flag is set,
/// so the first Ctrl+C only cancels the token and the second exits 130.
pub fn register_signal_handler(interrupt: CancellationToken) -> Result<()> {
    let mut first_registration = false;
    let flag = INTERRUPT_FLAG.get_or_init(|| {
        first_registration = true;
        Arc::new(AtomicBool::new(false))
    });

    if first_registration {
        let exit_flag = Arc::clone(flag);
        unsafe {
            signal_hook::low_level::register(signal_hook::consts::SIGINT, move || {
                if exit_flag.load(Ordering::SeqCst) {
                    std::process::exit(130);
                }
            })?;
        }
        signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(flag))?;
    }

    // Signal handlers cannot touch the runtime; poll the flag instead.
    let poll_flag = Arc::clone(flag);
    tokio::spawn(async move {
        loop {
            if poll_flag.load(Ordering::SeqCst) {
                interrupt.cancel();
                return;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
        }
    });

    Ok(())
}
