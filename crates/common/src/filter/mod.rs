//! Accept-rule compilation and matching
//!
//! A rule file is compiled into a [`Filters`] value holding one [`CompiledFilterSet`]
//! per connection type (or a single classic set). Each set has an `inbound` filter for
//! requests arriving over the tunnel and an `outbound` filter for local requests that
//! are about to be relayed.

mod cache;
mod compile;
mod path;
mod predicate;
mod rule;

pub use cache::{PatternCache, glob_to_regex, is_glob, pattern_cache};
pub use compile::{CompiledFilterSet, Filter, FilterError, Filters, RuleFile, RuleSet};
pub use path::{config_segments, template_to_regex};
pub use rule::{ANY_METHODS, AuthSpec, Rule, ValidEntry};
