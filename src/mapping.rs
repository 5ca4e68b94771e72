//! Pure mapping from application events to record bodies.

use serde::{Deserialize, Serialize};

use crate::event::{AppEvent, GroupEvent, IdentifyEvent, PageEvent, Properties, TrackEvent};

/// Identity learned from identify / group events.
///
/// Attached to every record mapped after it was set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    pub user_id: Option<String>,
    pub traits: Properties,
    pub group_id: Option<String>,
    pub group_traits: Properties,
}

impl Session {
    /// Fold an event into the session. Only identify and group change it;
    /// values are replaced, not merged.
    pub fn apply(&mut self, event: &AppEvent) {
        match event {
            AppEvent::Identify(identify) => {
                if identify.user_id.is_some() {
                    self.user_id = identify.user_id.clone();
                }
                self.traits = identify.traits.clone();
            }
            AppEvent::Group(group) => {
                self.group_id = Some(group.group_id.clone());
                self.group_traits = group.traits.clone();
            }
            AppEvent::Page(_) | AppEvent::Track(_) => {}
        }
    }
}

/// Which page views turn into records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageTracking {
    pub all: bool,
    pub named: bool,
    pub categorized: bool,
}

impl Default for PageTracking {
    fn default() -> Self {
        Self {
            all: false,
            named: true,
            categorized: true,
        }
    }
}

/// JSON body of one outbound record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordBody {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<Properties>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anonymous_id: Option<String>,
    #[serde(skip_serializing_if = "Properties::is_empty")]
    pub traits: Properties,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(skip_serializing_if = "Properties::is_empty")]
    pub group_traits: Properties,
}

impl RecordBody {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Map an event to zero or more record bodies.
///
/// `session` must already include the effect of `event` (see
/// [`Session::apply`]). Deterministic and side-effect free.
pub fn map_event(event: &AppEvent, session: &Session, pages: PageTracking) -> Vec<RecordBody> {
    let anonymous_id = event.anonymous_id();
    match event {
        AppEvent::Track(track) => vec![map_track(track, anonymous_id, session)],
        AppEvent::Page(page) => map_page(page, anonymous_id, session, pages),
        AppEvent::Identify(identify) => vec![map_identify(identify, anonymous_id, session)],
        AppEvent::Group(group) => vec![map_group(group, anonymous_id, session)],
    }
}

fn base(kind: &'static str, anonymous_id: Option<&str>, session: &Session) -> RecordBody {
    RecordBody {
        kind,
        event: None,
        properties: None,
        user_id: session.user_id.clone(),
        anonymous_id: anonymous_id.map(str::to_string),
        traits: session.traits.clone(),
        group_id: session.group_id.clone(),
        group_traits: Properties::new(),
    }
}

fn map_track(track: &TrackEvent, anonymous_id: Option<&str>, session: &Session) -> RecordBody {
    let mut body = base("track", anonymous_id, session);
    body.event = Some(track.event.clone());
    body.properties = Some(track.properties.clone());
    if track.user_id.is_some() {
        body.user_id = track.user_id.clone();
    }
    body
}

fn map_page(
    page: &PageEvent,
    anonymous_id: Option<&str>,
    session: &Session,
    pages: PageTracking,
) -> Vec<RecordBody> {
    let mut properties = page.properties.clone();
    if let Some(name) = &page.name {
        properties.insert("name".into(), name.clone().into());
    }
    if let Some(category) = &page.category {
        properties.insert("category".into(), category.clone().into());
    }

    let mut names = Vec::new();
    if pages.all {
        names.push("Loaded a Page".to_string());
    }
    if pages.named {
        if let Some(full_name) = page.full_name() {
            names.push(format!("Viewed {full_name} Page"));
        }
    }
    if pages.categorized {
        if let Some(category) = &page.category {
            names.push(format!("Viewed {category} Page"));
        }
    }

    names
        .into_iter()
        .map(|name| {
            let mut body = base("track", anonymous_id, session);
            body.event = Some(name);
            body.properties = Some(properties.clone());
            body
        })
        .collect()
}

fn map_identify(identify: &IdentifyEvent, anonymous_id: Option<&str>, session: &Session) -> RecordBody {
    let mut body = base("identify", anonymous_id, session);
    if identify.user_id.is_some() {
        body.user_id = identify.user_id.clone();
    }
    body.traits = identify.traits.clone();
    body
}

fn map_group(group: &GroupEvent, anonymous_id: Option<&str>, session: &Session) -> RecordBody {
    let mut body = base("group", anonymous_id, session);
    body.group_id = Some(group.group_id.clone());
    body.group_traits = group.traits.clone();
    body
}
