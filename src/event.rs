//! Application events accepted by the dispatcher.
//!
//! A closed set of variants; each carries the fields it needs explicitly.

use serde_json::{Map, Value};

/// Free-form property / trait map. Never interpreted by the dispatcher.
pub type Properties = Map<String, Value>;

#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    Page(PageEvent),
    Identify(IdentifyEvent),
    Group(GroupEvent),
    Track(TrackEvent),
}

impl AppEvent {
    pub fn anonymous_id(&self) -> Option<&str> {
        match self {
            AppEvent::Page(e) => e.anonymous_id.as_deref(),
            AppEvent::Identify(e) => e.anonymous_id.as_deref(),
            AppEvent::Group(e) => e.anonymous_id.as_deref(),
            AppEvent::Track(e) => e.anonymous_id.as_deref(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AppEvent::Page(_) => "page",
            AppEvent::Identify(_) => "identify",
            AppEvent::Group(_) => "group",
            AppEvent::Track(_) => "track",
        }
    }
}

/// A page view.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageEvent {
    pub name: Option<String>,
    pub category: Option<String>,
    pub properties: Properties,
    pub anonymous_id: Option<String>,
}

impl PageEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_anonymous_id(mut self, id: impl Into<String>) -> Self {
        self.anonymous_id = Some(id.into());
        self
    }

    /// `"{category} {name}"` when both are set, otherwise the name.
    pub fn full_name(&self) -> Option<String> {
        match (&self.category, &self.name) {
            (Some(category), Some(name)) => Some(format!("{category} {name}")),
            (None, Some(name)) => Some(name.clone()),
            _ => None,
        }
    }
}

/// Identifies the current user; replaces the session's user id and traits.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdentifyEvent {
    pub user_id: Option<String>,
    pub traits: Properties,
    pub anonymous_id: Option<String>,
}

impl IdentifyEvent {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::default()
        }
    }

    /// Traits only, user stays anonymous.
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn with_trait(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.traits.insert(key.into(), value.into());
        self
    }

    pub fn with_anonymous_id(mut self, id: impl Into<String>) -> Self {
        self.anonymous_id = Some(id.into());
        self
    }
}

/// Associates the current user with a group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupEvent {
    pub group_id: String,
    pub traits: Properties,
    pub anonymous_id: Option<String>,
}

impl GroupEvent {
    pub fn new(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            ..Self::default()
        }
    }

    pub fn with_trait(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.traits.insert(key.into(), value.into());
        self
    }

    pub fn with_anonymous_id(mut self, id: impl Into<String>) -> Self {
        self.anonymous_id = Some(id.into());
        self
    }
}

/// A named action.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackEvent {
    pub event: String,
    pub properties: Properties,
    pub user_id: Option<String>,
    pub anonymous_id: Option<String>,
}

impl TrackEvent {
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            ..Self::default()
        }
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Explicit user id; otherwise the identified session user is used.
    pub fn with_user_id(mut self, id: impl Into<String>) -> Self {
        self.user_id = Some(id.into());
        self
    }

    pub fn with_anonymous_id(mut self, id: impl Into<String>) -> Self {
        self.anonymous_id = Some(id.into());
        self
    }
}

impl From<PageEvent> for AppEvent {
    fn from(e: PageEvent) -> Self {
        AppEvent::Page(e)
    }
}

impl From<IdentifyEvent> for AppEvent {
    fn from(e: IdentifyEvent) -> Self {
        AppEvent::Identify(e)
    }
}

impl From<GroupEvent> for AppEvent {
    fn from(e: GroupEvent) -> Self {
        AppEvent::Group(e)
    }
}

impl From<TrackEvent> for AppEvent {
    fn from(e: TrackEvent) -> Self {
        AppEvent::Track(e)
    }
}
