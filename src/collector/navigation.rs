use std::sync::{Arc, Mutex};
use url::Url;

const RELATIVE_BASE: &str = "http://localhost/";

/// Client-side navigation that did not reload the page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavigationEvent {
    Push(String),
    Replace(String),
    Pop(String),
}

impl NavigationEvent {
    pub fn location(&self) -> &str {
        match self {
            NavigationEvent::Push(location)
            | NavigationEvent::Replace(location)
            | NavigationEvent::Pop(location) => location,
        }
    }

    /// Path component of the location. Relative locations are resolved
    /// against the site root, so query and fragment never reach the path.
    pub fn path(&self) -> String {
        let location = self.location();
        Url::parse(location)
            .or_else(|_| Url::parse(RELATIVE_BASE).and_then(|base| base.join(location)))
            .map(|url| url.path().to_string())
            .unwrap_or_else(|_| location.to_string())
    }
}

type Listener = Arc<dyn Fn(&NavigationEvent) + Send + Sync>;

/// Registry the host page reports its navigations to.
#[derive(Clone, Default)]
pub struct Navigator {
    listeners: Arc<Mutex<Vec<Listener>>>,
}

impl Navigator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&NavigationEvent) + Send + Sync + 'static,
    {
        match self.listeners.lock() {
            Ok(mut listeners) => listeners.push(Arc::new(listener)),
            Err(_) => tracing::warn!("Navigation listener registration failed"),
        }
    }

    pub fn emit(&self, event: NavigationEvent) {
        let listeners = match self.listeners.lock() {
            Ok(listeners) => listeners.clone(),
            Err(_) => return,
        };
        for listener in listeners {
            listener(&event);
        }
    }
}
