//! Matching of change events against registered sequencer rules.
//!
//! Matching is total over well-formed configurations: expressions were
//! compiled at registration time, so evaluation cannot fail.

use std::sync::Arc;

use crate::event::ChangeEvent;
use crate::path::PathMatch;
use crate::sequencer::SequencerConfig;

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutput {
    NoMatch,
    Match(PathMatch),
}

/// A sequencer selected for an event, with the output location of its job.
#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub struct MatchedSequencer {
    pub config: Arc<SequencerConfig>,
    pub output_path: Option<String>,
}

#[allow(missing_docs)]
#[derive(Debug, Default, Clone, Copy)]
pub struct PathMatcher;

impl PathMatcher {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Evaluates one configuration's rules (OR-ed) against an event.
    #[must_use]
    pub fn evaluate(&self, config: &SequencerConfig, event: &ChangeEvent) -> MatchOutput {
        match config.find_match(event) {
            Some(m) => MatchOutput::Match(m),
            None => MatchOutput::NoMatch,
        }
    }

    /// Returns every configuration in `snapshot` that matches, in snapshot order.
    /// Each one yields an independent job.
    #[must_use]
    pub fn match_event(&self, event: &ChangeEvent, snapshot: &[Arc<SequencerConfig>]) -> Vec<MatchedSequencer> {
        snapshot
            .iter()
            .filter_map(|config| match self.evaluate(config, event) {
                MatchOutput::Match(m) => Some(MatchedSequencer {
                    config: Arc::clone(config),
                    output_path: m.output_path,
                }),
                MatchOutput::NoMatch => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeSet;

    use crate::event::{EventKind, EventSource, RawNotification, SessionHandle};
    use crate::sequencer::from_fn;

    fn config(name: &str, exprs: &[&str]) -> Arc<SequencerConfig> {
        Arc::new(
            SequencerConfig::builder(name)
                .path_expressions(exprs.iter().copied())
                .sequencer("noop", from_fn(|_ctx| Ok(())))
                .build()
                .unwrap(),
        )
    }

    fn event(path: &str, property: &str) -> Arc<ChangeEvent> {
        EventSource
            .normalize(RawNotification::property(
                EventKind::Added,
                path,
                property,
                SessionHandle::new("default"),
            ))
            .unwrap()
    }

    fn names(matches: &[MatchedSequencer]) -> BTreeSet<String> {
        matches.iter().map(|m| m.config.name().to_string()).collect()
    }

    #[test]
    fn single_rule_scenario() {
        let snapshot = vec![config("A", &["/foo/*@data"])];
        let matcher = PathMatcher::new();

        let hits = matcher.match_event(&event("/foo/bar", "data"), &snapshot);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].config.name(), "A");

        assert!(matcher.match_event(&event("/baz", "data"), &snapshot).is_empty());
    }

    #[test]
    fn every_matching_config_is_returned() {
        let snapshot = vec![
            config("images", &["/media/**/*.png@data"]),
            config("all-data", &["/**@data"]),
            config("titles", &["/**@title"]),
            config("media-or-docs", &["/docs/*", "/media/**"]),
        ];
        let matcher = PathMatcher::new();

        let hits = matcher.match_event(&event("/media/a/b.png", "data"), &snapshot);
        let expected: BTreeSet<String> = ["images", "all-data", "media-or-docs"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(names(&hits), expected);

        let hits = matcher.match_event(&event("/docs/x", "title"), &snapshot);
        let expected: BTreeSet<String> = ["titles", "media-or-docs"].iter().map(|s| s.to_string()).collect();
        assert_eq!(names(&hits), expected);
    }

    #[test]
    fn matched_set_equals_structural_matches() {
        let exprs = ["/a/*", "/a/**@p", "/*/b@q", "/**/c", "/a/b@p", "{other}/a/b"];
        let snapshot: Vec<_> = exprs
            .iter()
            .enumerate()
            .map(|(i, e)| config(&format!("s{i}"), &[*e]))
            .collect();
        let matcher = PathMatcher::new();

        for path in ["/a", "/a/b", "/a/b/c", "/x/b", "/c"] {
            for property in ["p", "q"] {
                let ev = event(path, property);
                let hits = names(&matcher.match_event(&ev, &snapshot));
                let expected: BTreeSet<String> = snapshot
                    .iter()
                    .filter(|c| {
                        c.path_expressions()
                            .iter()
                            .any(|e| e.matches(ev.workspace(), ev.path(), ev.property()).is_some())
                    })
                    .map(|c| c.name().to_string())
                    .collect();
                assert_eq!(hits, expected, "path={path} property={property}");
            }
        }
    }

    #[test]
    fn output_path_comes_from_matching_rule() {
        let snapshot = vec![config("thumbs", &["/images/*@data => /thumbs/$1"])];
        let hits = PathMatcher::new().match_event(&event("/images/cat", "data"), &snapshot);
        assert_eq!(hits[0].output_path.as_deref(), Some("/thumbs/cat"));
    }
}
