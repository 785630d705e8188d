//! The fixed set of upstream endpoints the gateway will forward to.
//!
//! Matching is exact on the URL path: there is no prefix or wildcard matching, and the query
//! string plays no part in route selection.
use std::fmt;

/// How the body of a route is treated on its way through the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    /// A JSON body that is buffered and checked against the route's schema.
    Json,
    /// A binary or multipart body that is streamed upstream untouched.
    Passthrough,
}

/// An allow-listed upstream endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    ChatCompletions,
    Completions,
    AudioTranscriptions,
}

impl Route {
    pub const ALL: [Route; 3] = [
        Route::ChatCompletions,
        Route::Completions,
        Route::AudioTranscriptions,
    ];

    /// Look up the route for a request path, returning `None` for anything not allow-listed.
    pub fn from_path(path: &str) -> Option<Self> {
        match path {
            "/v1/chat/completions" => Some(Route::ChatCompletions),
            "/v1/completions" => Some(Route::Completions),
            "/v1/audio/transcriptions" => Some(Route::AudioTranscriptions),
            _ => None,
        }
    }

    pub fn path(self) -> &'static str {
        match self {
            Route::ChatCompletions => "/v1/chat/completions",
            Route::Completions => "/v1/completions",
            Route::AudioTranscriptions => "/v1/audio/transcriptions",
        }
    }

    pub fn body_kind(self) -> BodyKind {
        match self {
            Route::ChatCompletions | Route::Completions => BodyKind::Json,
            Route::AudioTranscriptions => BodyKind::Passthrough,
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

/// Whether a request path is one the gateway forwards.
pub fn is_allowed(path: &str) -> bool {
    Route::from_path(path).is_some()
}
