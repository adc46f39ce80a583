use signal_hook::{
    consts::{SIGHUP, SIGINT, SIGTERM},
    iterator::Signals,
};
use statuspage::view::ViewRegistry;
use std::sync::Arc;
use tokio::sync::watch;

/// Resolves once the process has been asked to stop.
pub struct Shutdown(watch::Receiver<bool>);

impl Shutdown {
    pub async fn wait(mut self) {
        let _ = self.0.wait_for(|stop| *stop).await;
    }
}

/// What should we do when the user stops this program?
pub fn handle_shutdown() -> std::io::Result<Shutdown> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let (tx, rx) = watch::channel(false);

    std::thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            log::info!("Received signal {signal}, shutting down");
            let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Stopping]);
            let _ = tx.send(true);
        }
    });
    Ok(Shutdown(rx))
}

/// SIGHUP re-fetches every open view from the backend.
pub fn handle_reload(
    registry: Arc<ViewRegistry>,
    rt_handle: tokio::runtime::Handle,
) -> std::io::Result<()> {
    let mut signals = Signals::new([SIGHUP])?;

    std::thread::spawn(move || {
        for _ in signals.forever() {
            let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Reloading]);
            log::info!("Reloading all views");
            rt_handle.block_on(registry.resync_all());
            let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]);
        }
    });
    Ok(())
}

pub fn notify_ready() {
    let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]);
}
