use tokio::sync::watch;

/// A set-once flag that can be awaited.
///
/// Setting it before anyone waits is not lost: every later `wait`
/// returns immediately.
#[derive(Debug)]
pub(crate) struct Signal {
    tx: watch::Sender<bool>,
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl Signal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn set(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so this cannot fail while we borrow it.
        let _ = rx.wait_for(|set| *set).await;
    }
}

/// Tracks whether listener callbacks are running, so that another
/// task can wait for them to return.
#[derive(Debug)]
pub(crate) struct Busy {
    tx: watch::Sender<usize>,
}

impl Default for Busy {
    fn default() -> Self {
        let (tx, _) = watch::channel(0);
        Self { tx }
    }
}

impl Busy {
    pub fn enter(&self) -> BusyGuard<'_> {
        self.tx.send_modify(|n| *n += 1);
        BusyGuard { busy: self }
    }

    pub async fn idle(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

pub(crate) struct BusyGuard<'a> {
    busy: &'a Busy,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.busy.tx.send_modify(|n| *n = n.saturating_sub(1));
    }
}
