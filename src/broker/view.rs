//! Topic view specifications.
//!
//! A view maps source topics to reference topics:
//!
//! ```text
//! map sensors/temperature to views/temperature
//! map ?sensors// to views/sensors
//! ```
//!
//! The first form maps exactly one topic. In the second, `?` introduces a
//! selector and the trailing `//` selects the path and all of its
//! descendants, which keep their relative path under the target.

use std::collections::BTreeSet;

use crate::topic::{TopicPath, TopicView};

#[derive(Debug, Clone, PartialEq)]
pub struct ViewSpec {
    source: TopicPath,
    descendants: bool,
    target: TopicPath,
}

impl ViewSpec {
    pub fn parse(specification: &str) -> Result<Self, String> {
        let words: Vec<&str> = specification.split_whitespace().collect();
        let [map, selector, to, target] = words[..] else {
            return Err("expected 'map <source> to <target>'".to_string());
        };
        if !map.eq_ignore_ascii_case("map") {
            return Err(format!("expected 'map', found '{map}'"));
        }
        if !to.eq_ignore_ascii_case("to") {
            return Err(format!("expected 'to', found '{to}'"));
        }

        let selector = selector.strip_prefix('?').unwrap_or(selector);
        let (source, descendants) = match selector.strip_suffix("//") {
            Some(source) => (source, true),
            None => (selector, false),
        };
        let source =
            TopicPath::parse(source).map_err(|_| format!("invalid source path '{source}'"))?;
        let target =
            TopicPath::parse(target).map_err(|_| format!("invalid target path '{target}'"))?;
        if is_within(&target, &source) {
            return Err("target lies inside the mapped source".to_string());
        }

        Ok(Self {
            source,
            descendants,
            target,
        })
    }

    /// Path of the reference topic for `path`, if this view maps it.
    pub fn map(&self, path: &TopicPath) -> Option<TopicPath> {
        if path == &self.source {
            return Some(self.target.clone());
        }
        if !self.descendants {
            return None;
        }
        let rest = path
            .as_str()
            .strip_prefix(self.source.as_str())?
            .strip_prefix('/')?;
        TopicPath::parse(&format!("{}/{rest}", self.target)).ok()
    }
}

fn is_within(path: &TopicPath, root: &TopicPath) -> bool {
    path == root
        || path
            .as_str()
            .strip_prefix(root.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
}

/// A view held by the broker.
#[derive(Debug, Clone)]
pub struct View {
    pub name: String,
    pub specification: String,
    pub spec: ViewSpec,
    pub roles: BTreeSet<String>,
}

impl View {
    pub fn describe(&self) -> TopicView {
        TopicView {
            name: self.name.clone(),
            specification: self.specification.clone(),
            roles: self.roles.clone(),
        }
    }
}
