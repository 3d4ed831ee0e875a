//! Filter-match results returned by the script payload.

use abx_engine::JsSnapshot;
use serde::Deserialize;

/// What kind of filter matched a request, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    /// No filter matched.
    None,
    /// A blocking filter; the request should be cancelled.
    Blocking,
    /// A whitelisting filter; the request is explicitly allowed.
    Whitelist,
    /// An element-hiding filter.
    ElemHide,
    /// An exception to an element-hiding filter.
    ElemHideException,
    /// The matched line is a comment.
    Comment,
    /// The matched line could not be parsed as a filter.
    Invalid,
}

impl FilterKind {
    fn parse(tag: &str) -> FilterKind {
        match tag {
            "none" => FilterKind::None,
            "blocking" => FilterKind::Blocking,
            "whitelist" => FilterKind::Whitelist,
            "elemhide" => FilterKind::ElemHide,
            "elemhideexception" => FilterKind::ElemHideException,
            "comment" => FilterKind::Comment,
            _ => FilterKind::Invalid,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FilterKind::None => "none",
            FilterKind::Blocking => "blocking",
            FilterKind::Whitelist => "whitelist",
            FilterKind::ElemHide => "elemhide",
            FilterKind::ElemHideException => "elemhideexception",
            FilterKind::Comment => "comment",
            FilterKind::Invalid => "invalid",
        }
    }
}

/// Outcome of a filter check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterResult {
    pub kind: FilterKind,
    /// Whether a blocked element should be collapsed in the page.
    pub collapse: bool,
}

impl FilterResult {
    /// The conservative default: nothing matched, collapse left at its
    /// default.
    pub const NO_MATCH: FilterResult = FilterResult {
        kind: FilterKind::None,
        collapse: true,
    };

    pub fn is_blocking(&self) -> bool {
        self.kind == FilterKind::Blocking
    }

    /// Parses the tagged `{kind, collapse?}` object the script returns
    /// (either as an object snapshot or a JSON string). Anything
    /// unparseable degrades to [`FilterResult::NO_MATCH`].
    pub fn from_snapshot(snapshot: &JsSnapshot) -> FilterResult {
        let json = match snapshot {
            JsSnapshot::Json(json) => json.as_str(),
            JsSnapshot::String(json) => json.as_str(),
            _ => return FilterResult::NO_MATCH,
        };
        #[derive(Deserialize)]
        struct RawResult {
            kind: String,
            #[serde(default)]
            collapse: Option<bool>,
        }
        match serde_json::from_str::<RawResult>(json) {
            Ok(raw) => FilterResult {
                kind: FilterKind::parse(&raw.kind),
                // absent means "do collapse"
                collapse: raw.collapse.unwrap_or(true),
            },
            Err(err) => {
                log::warn!("unparseable filter result {json:?}: {err}");
                FilterResult::NO_MATCH
            }
        }
    }
}
