use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

/// Host-side publisher of page visibility.
///
/// Whatever the embedding environment exposes (a window focus hook, a
/// foreground/background notification) is forwarded here.
#[derive(Debug)]
pub struct VisibilitySignal {
    tx: watch::Sender<Visibility>,
}

impl Default for VisibilitySignal {
    fn default() -> Self {
        Self::new(Visibility::Visible)
    }
}

impl VisibilitySignal {
    pub fn new(initial: Visibility) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn set(&self, visibility: Visibility) {
        self.tx.send_if_modified(|current| {
            if *current == visibility {
                false
            } else {
                *current = visibility;
                true
            }
        });
    }

    pub fn set_visible(&self) {
        self.set(Visibility::Visible);
    }

    pub fn set_hidden(&self) {
        self.set(Visibility::Hidden);
    }

    pub fn current(&self) -> Visibility {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Visibility> {
        self.tx.subscribe()
    }
}

type GateCallback = Box<dyn Fn() + Send + Sync + 'static>;

/// Listens for visibility transitions and forwards them to callbacks.
///
/// Only transitions observed after [`VisibilityGate::attach`] fire; the state at
/// attach time is taken as already seen. Dropping the gate detaches it.
#[derive(Debug)]
pub struct VisibilityGate {
    listener: Option<JoinHandle<()>>,
}

impl VisibilityGate {
    /// Gate that never fires, for hosts without a visibility concept
    pub fn detached() -> Self {
        Self { listener: None }
    }

    pub fn attach<V, H>(mut rx: watch::Receiver<Visibility>, on_visible: V, on_hidden: H) -> Self
    where
        V: Fn() + Send + Sync + 'static,
        H: Fn() + Send + Sync + 'static,
    {
        let on_visible: GateCallback = Box::new(on_visible);
        let on_hidden: GateCallback = Box::new(on_hidden);
        rx.borrow_and_update();

        let listener = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let visibility = *rx.borrow_and_update();
                match visibility {
                    Visibility::Visible => on_visible(),
                    Visibility::Hidden => on_hidden(),
                }
            }
        });

        Self { listener: Some(listener) }
    }

    pub fn is_attached(&self) -> bool {
        self.listener.as_ref().is_some_and(|l| !l.is_finished())
    }

    pub fn detach(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

impl Drop for VisibilityGate {
    fn drop(&mut self) {
        self.detach();
    }
}
