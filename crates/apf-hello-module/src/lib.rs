//! Hello module
//!
//! A small loadable module. Provides a `Hello` greeter that counts its
//! visits and a `HelloAnnouncer` singleton that broadcasts announcements.
//! Hosts link this crate as an `rlib` for the capability traits and load the
//! `cdylib` at run time.

use std::sync::atomic::{AtomicU64, Ordering};

use apf_core::module::{ModuleDefinition, Version};
use apf_core::{Capability, CapabilityTable, Component, FactoryRecord, Signal};
use once_cell::sync::Lazy;

pub const HELLO_ID: &str = "Hello";
pub const ANNOUNCER_ID: &str = "HelloAnnouncer";

pub trait Greeter: Send + Sync {
    fn greet(&self, name: &str) -> String;
}

impl Capability for dyn Greeter {
    const NAME: &'static str = "apf.hello.Greeter";
}

pub trait Visits: Send + Sync {
    fn visits(&self) -> u64;
}

impl Capability for dyn Visits {
    const NAME: &'static str = "apf.hello.Visits";
}

pub trait Announcements: Send + Sync {
    fn announce(&self, message: &str);

    fn events(&self) -> &Signal<String>;
}

impl Capability for dyn Announcements {
    const NAME: &'static str = "apf.hello.Announcements";
}

struct Hello {
    visits: AtomicU64,
}

impl Greeter for Hello {
    fn greet(&self, name: &str) -> String {
        self.visits.fetch_add(1, Ordering::Relaxed);
        format!("Hello, {}!", name)
    }
}

impl Visits for Hello {
    fn visits(&self) -> u64 {
        self.visits.load(Ordering::Relaxed)
    }
}

impl Component for Hello {
    fn create() -> Self {
        Hello {
            visits: AtomicU64::new(0),
        }
    }

    fn capabilities(table: &mut CapabilityTable<Self>) {
        table
            .expose::<dyn Greeter>(|h| h)
            .expose::<dyn Visits>(|h| h);
    }
}

struct Announcer {
    events: Signal<String>,
}

impl Announcements for Announcer {
    fn announce(&self, message: &str) {
        let delivered = self.events.emit(&message.to_string());
        tracing::debug!("Announced to {} listeners", delivered);
    }

    fn events(&self) -> &Signal<String> {
        &self.events
    }
}

impl Component for Announcer {
    fn create() -> Self {
        Announcer {
            events: Signal::new(),
        }
    }

    fn capabilities(table: &mut CapabilityTable<Self>) {
        table.expose::<dyn Announcements>(|a| a);
    }
}

/// This module's definition.
pub static MODULE: Lazy<ModuleDefinition> = Lazy::new(|| {
    ModuleDefinition::builder(Version::new(1, 0))
        .supports(Version::new(1, 0), Version::MAX)
        .class(FactoryRecord::component::<Hello>(HELLO_ID))
        .class(FactoryRecord::singleton::<Announcer>(ANNOUNCER_ID))
        .build()
});

apf_core::export_module!(MODULE);
