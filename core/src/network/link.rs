use alloc::boxed::Box;

use crate::buffers::Buffer;
use crate::scheduler::TaskHandle;

use super::NetworkStatus;

/// Events a link reports to its registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NetworkNotification {
    /// The link came up and is ready for data.
    Connected,
}

/// Notification callback. Context travels in the closure captures.
pub type NotifyHandler = Box<dyn FnMut(NetworkNotification)>;

/// Optional fields every link carries alongside its operations.
#[derive(Default)]
pub struct LinkExtensions {
    notify_handler: Option<NotifyHandler>,
    consumer_task: Option<TaskHandle>,
}

impl LinkExtensions {
    pub fn set_notify_handler(&mut self, handler: Option<NotifyHandler>) {
        self.notify_handler = handler;
    }

    pub fn set_consumer_task(&mut self, task: Option<TaskHandle>) {
        self.consumer_task = task;
    }

    pub fn consumer_task(&self) -> Option<&TaskHandle> {
        self.consumer_task.as_ref()
    }

    /// Invokes the notification handler, if one is registered.
    pub fn notify(&mut self, notification: NetworkNotification) {
        if let Some(handler) = self.notify_handler.as_mut() {
            handler(notification);
        }
    }

    /// Resumes the consumer task, if one is registered.
    pub fn wake_consumer(&self) {
        if let Some(task) = &self.consumer_task {
            task.resume();
        }
    }
}

impl core::fmt::Debug for LinkExtensions {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LinkExtensions")
            .field("notify_handler", &self.notify_handler.is_some())
            .field("consumer_task", &self.consumer_task)
            .finish()
    }
}

/// The uniform capability exposed by every layer of the network stack.
///
/// `send` takes ownership of the payload contents and leaves the buffer
/// empty on success. `receive` expects an empty buffer and replaces it with
/// the next payload. Neither blocks: `Retry` means "not now".
pub trait NetworkLink {
    fn connect(&mut self) -> NetworkStatus;

    fn disconnect(&mut self) -> NetworkStatus;

    fn send(&mut self, payload: &mut Buffer) -> NetworkStatus;

    fn receive(&mut self, payload: &mut Buffer) -> NetworkStatus;

    /// Reports `Connected`, `NotConnected`, `Retry` while transitioning,
    /// `DriverFailure` or `NotValid`.
    fn monitor(&mut self) -> NetworkStatus;

    fn extensions(&mut self) -> &mut LinkExtensions;

    fn set_notify_handler(&mut self, handler: Option<NotifyHandler>) {
        self.extensions().set_notify_handler(handler);
    }

    /// Sets the task to resume whenever received data becomes available.
    fn set_consumer_task(&mut self, task: Option<TaskHandle>) {
        self.extensions().set_consumer_task(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::rc::Rc;
    use core::cell::Cell;

    #[test]
    fn test_notify_without_handler_is_noop() {
        let mut ext = LinkExtensions::default();
        ext.notify(NetworkNotification::Connected);
        ext.wake_consumer();
    }

    #[test]
    fn test_notify_reaches_handler_context() {
        let seen = Rc::new(Cell::new(0));
        let context = seen.clone();
        let mut ext = LinkExtensions::default();
        ext.notify_handler = Some(Box::new(move |n| {
            assert_eq!(n, NetworkNotification::Connected);
            context.set(context.get() + 1);
        }));
        ext.notify(NetworkNotification::Connected);
        assert_eq!(seen.get(), 1);
    }

    #[test]
    fn test_wake_consumer() {
        let task = TaskHandle::new();
        let ext = LinkExtensions {
            notify_handler: None,
            consumer_task: Some(task.clone()),
        };
        ext.wake_consumer();
        assert!(task.is_resumed());
    }
}
