use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tokio::sync::Notify;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);
static INTERRUPT_NOTIFY: OnceLock<Notify> = OnceLock::new();

fn notify() -> &'static Notify {
    INTERRUPT_NOTIFY.get_or_init(Notify::new)
}

/// Installs the Ctrl+C handler.
///
/// The handler only raises the interrupt flag and wakes waiters. Whoever
/// owns the terminal decides what an interrupt means: at the prompt it is a
/// hint, during a reply it abandons the reply.
///
/// # Errors
/// Returns an error if a handler is already installed or registration fails.
pub fn init() -> Result<()> {
    ctrlc::set_handler(trigger).context("Failed to set Ctrl+C handler")
}

/// Raises the interrupt flag.
pub fn trigger() {
    INTERRUPTED.store(true, Ordering::SeqCst);
    notify().notify_waiters();
}

pub fn is_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Waits until an interrupt is triggered.
pub async fn wait_for_interrupt() {
    loop {
        let notified = notify().notified();
        if is_interrupted() {
            return;
        }
        notified.await;
    }
}

/// Clears the interrupt flag.
pub fn reset() {
    INTERRUPTED.store(false, Ordering::SeqCst);
}
