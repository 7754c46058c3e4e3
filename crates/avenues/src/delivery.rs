//! The context in which claim callbacks and error sinks are invoked.
//!
//! The avenue never invokes callbacks while holding one of its locks. Instead, every outbound
//! notification is handed to a [`Dispatcher`] once all locks have been released. The
//! [`Delivery`] chosen at construction decides where the notification actually runs. A panicking
//! notification is logged and never keeps the ones after it from running.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};

use tokio::runtime::Handle;
use tokio::sync::mpsc;

/// A pending notification.
pub type Notification = Box<dyn FnOnce() + Send>;

/// Runs `notification`, containing a panic so that later notifications still run.
fn run_isolated(notification: Notification) {
    if catch_unwind(AssertUnwindSafe(notification)).is_err() {
        tracing::error!("notification panicked");
    }
}

/// Where notifications of an avenue run.
#[derive(Clone, Default)]
pub enum Delivery {
    /// Notifications run right away on the thread that triggered them.
    ///
    /// This is either the caller of an avenue operation, or the thread completing a production.
    #[default]
    Inline,
    /// Notifications are queued, and run whenever the owner of the [`DeliveryQueue`] drains it.
    ///
    /// Created by [`Delivery::queue`].
    Queue(DeliverySender),
    /// Notifications run in order on a dedicated task of the given runtime.
    Runtime(Handle),
}

impl Delivery {
    /// Creates a queued delivery along with the queue its notifications end up in.
    pub fn queue() -> (Self, DeliveryQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::Queue(DeliverySender { tx }), DeliveryQueue { rx })
    }

    /// Delivery on the runtime the caller is running on.
    ///
    /// Falls back to inline delivery outside of a runtime.
    pub fn current_runtime() -> Self {
        match Handle::try_current() {
            Ok(handle) => Self::Runtime(handle),
            Err(_) => Self::Inline,
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inline => write!(f, "Inline"),
            Self::Queue(_) => write!(f, "Queue"),
            Self::Runtime(_) => write!(f, "Runtime"),
        }
    }
}

/// The sending half of a [`Delivery::Queue`].
#[derive(Clone)]
pub struct DeliverySender {
    tx: mpsc::UnboundedSender<Notification>,
}

/// Notifications queued by avenues using [`Delivery::Queue`].
///
/// Nothing is delivered unless the queue is drained.
pub struct DeliveryQueue {
    rx: mpsc::UnboundedReceiver<Notification>,
}

impl DeliveryQueue {
    /// Runs all notifications queued so far, returning how many ran.
    pub fn drain(&mut self) -> usize {
        let mut delivered = 0;
        while let Ok(notification) = self.rx.try_recv() {
            run_isolated(notification);
            delivered += 1;
        }
        delivered
    }

    /// Runs notifications as they arrive, until every avenue delivering into this queue is gone.
    pub async fn run(mut self) {
        while let Some(notification) = self.rx.recv().await {
            run_isolated(notification);
        }
    }

    /// The number of queued notifications.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl fmt::Debug for DeliveryQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryQueue")
            .field("len", &self.len())
            .finish()
    }
}

/// Hands notifications to the configured [`Delivery`].
pub(crate) enum Dispatcher {
    Inline,
    Channel(mpsc::UnboundedSender<Notification>),
}

impl Dispatcher {
    /// Creates the dispatcher for `delivery`.
    ///
    /// For [`Delivery::Runtime`], this spawns the task running the notifications. The task ends
    /// once the dispatcher is dropped.
    pub fn new(delivery: Delivery) -> Self {
        match delivery {
            Delivery::Inline => Self::Inline,
            Delivery::Queue(DeliverySender { tx }) => Self::Channel(tx),
            Delivery::Runtime(handle) => {
                let (tx, mut rx) = mpsc::unbounded_channel::<Notification>();
                handle.spawn(async move {
                    while let Some(notification) = rx.recv().await {
                        run_isolated(notification);
                    }
                });
                Self::Channel(tx)
            }
        }
    }

    pub fn dispatch(&self, notification: Notification) {
        match self {
            Self::Inline => run_isolated(notification),
            Self::Channel(tx) => {
                if tx.send(notification).is_err() {
                    tracing::debug!("delivery context is gone, dropping notification");
                }
            }
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inline => write!(f, "Inline"),
            Self::Channel(_) => write!(f, "Channel"),
        }
    }
}
