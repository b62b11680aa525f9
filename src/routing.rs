//! Recipient routing: which recipients are captured, and where they go.

use crate::error::Error;
use crate::swift::StoreConfig;
use std::collections::HashSet;

/// Name of the destination receiving otherwise unrouted recipients.
pub const DEFAULT_DESTINATION: &str = "DEFAULT";

/// A named capture target with its own recipients and store settings.
#[derive(Debug, Clone)]
pub struct Destination {
    pub name: String,
    /// Lower-cased addresses owned by this destination.
    pub recipients: Vec<String>,
    pub store: StoreConfig,
}

/// How recipients without a matching destination are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Every recipient must be owned by a destination.
    Strict,
    /// Unowned recipients go to the default destination.
    WithDefault,
}

/// Recipients of one transaction split by how they are delivered.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Classification {
    pub captured: Vec<String>,
    pub passthrough: Vec<String>,
}

/// Read-only table of destinations, loaded once per process.
#[derive(Debug, Default)]
pub struct RoutingTable {
    destinations: Vec<Destination>,
    default: Option<Destination>,
    captured: HashSet<String>,
}

impl RoutingTable {
    pub fn new(destinations: Vec<Destination>, default: Option<Destination>) -> Self {
        let captured = destinations
            .iter()
            .chain(default.iter())
            .flat_map(|d| d.recipients.iter())
            .map(|r| r.to_lowercase())
            .collect();
        Self {
            destinations,
            default,
            captured,
        }
    }

    /// Whether mail for `recipient` is diverted to the capture sink.
    pub fn is_captured(&self, recipient: &str) -> bool {
        self.captured.contains(&recipient.to_lowercase())
    }

    /// Partitions `recipients` into captured and passed-through, keeping order.
    pub fn classify(&self, recipients: &[String]) -> Classification {
        let (captured, passthrough) = recipients
            .iter()
            .cloned()
            .partition(|r| self.is_captured(r));
        Classification {
            captured,
            passthrough,
        }
    }

    #[cfg(test)]
    pub(crate) fn destinations(&self) -> &[Destination] {
        &self.destinations
    }

    fn owner(&self, recipient: &str) -> Option<&Destination> {
        let recipient = recipient.to_lowercase();
        self.destinations
            .iter()
            .chain(self.default.iter())
            .find(|d| d.recipients.iter().any(|r| r.to_lowercase() == recipient))
    }

    /// Resolves recipients to the unique destinations they are uploaded to.
    ///
    /// Destinations are returned in first-seen order.
    pub fn destinations_for(
        &self,
        recipients: &[String],
        resolution: Resolution,
    ) -> Result<Vec<&Destination>, Error> {
        let mut seen = HashSet::new();
        let mut result = Vec::new();

        for recipient in recipients {
            let destination = match (self.owner(recipient), resolution) {
                (Some(d), _) => d,
                (None, Resolution::WithDefault) => self
                    .default
                    .as_ref()
                    .ok_or_else(|| Error::RoutingInvariant(recipient.clone()))?,
                (None, Resolution::Strict) => {
                    return Err(Error::RoutingInvariant(recipient.clone()));
                }
            };
            if seen.insert(destination.name.as_str()) {
                result.push(destination);
            }
        }

        Ok(result)
    }
}

#[cfg(test)]
pub(crate) fn destination(name: &str, recipients: &[&str]) -> Destination {
    Destination {
        name: name.to_string(),
        recipients: recipients.iter().map(|r| r.to_string()).collect(),
        store: StoreConfig {
            container: format!("{name}-container"),
            ..StoreConfig::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[fixture]
    fn table() -> RoutingTable {
        RoutingTable::new(
            vec![
                destination("D1", &["a@x", "c@x"]),
                destination("D2", &["d@z"]),
            ],
            None,
        )
    }

    fn owned(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[rstest]
    #[case::none(&[], &[], &[])]
    #[case::one_captured(&["a@x"], &["a@x"], &[])]
    #[case::one_passthrough(&["b@y"], &[], &["b@y"])]
    #[case::some(&["a@x", "b@y"], &["a@x"], &["b@y"])]
    #[case::all(&["d@z", "a@x", "c@x"], &["d@z", "a@x", "c@x"], &[])]
    #[case::none_match(&["b@y", "e@y"], &[], &["b@y", "e@y"])]
    #[case::duplicates_kept(&["a@x", "b@y", "a@x"], &["a@x", "a@x"], &["b@y"])]
    fn test_classify(
        table: RoutingTable,
        #[case] recipients: &[&str],
        #[case] captured: &[&str],
        #[case] passthrough: &[&str],
    ) {
        let result = table.classify(&owned(recipients));
        assert_eq!(result.captured, owned(captured));
        assert_eq!(result.passthrough, owned(passthrough));
    }

    #[rstest]
    fn test_classify_is_case_insensitive(table: RoutingTable) {
        let result = table.classify(&owned(&["A@X"]));
        assert_eq!(result.captured, owned(&["A@X"]));
    }

    #[rstest]
    fn test_no_wildcard_matching(table: RoutingTable) {
        assert!(!table.is_captured("x"));
        assert!(!table.is_captured("other@x"));
        assert!(!table.is_captured("a@x.example"));
    }

    #[rstest]
    fn test_destinations_are_unique(table: RoutingTable) {
        let destinations = table
            .destinations_for(&owned(&["c@x", "d@z", "a@x"]), Resolution::Strict)
            .unwrap();
        let names: Vec<&str> = destinations.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["D1", "D2"]);
    }

    #[test]
    fn test_owner_matches_non_ascii_case() {
        let table = RoutingTable::new(
            vec![destination("D1", &["jürgen@x"])],
            Some(destination(DEFAULT_DESTINATION, &[])),
        );
        let recipients = owned(&["JÜRGEN@X"]);
        assert!(table.is_captured("JÜRGEN@X"));

        let destinations = table
            .destinations_for(&recipients, Resolution::WithDefault)
            .unwrap();
        let names: Vec<&str> = destinations.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["D1"]);
    }

    #[rstest]
    fn test_strict_unowned_is_invariant_violation(table: RoutingTable) {
        let result = table.destinations_for(&owned(&["a@x", "b@y"]), Resolution::Strict);
        assert!(matches!(result, Err(Error::RoutingInvariant(r)) if r == "b@y"));
    }

    #[test]
    fn test_default_catches_unowned() {
        let table = RoutingTable::new(
            vec![destination("D1", &["a@x"])],
            Some(destination(DEFAULT_DESTINATION, &[])),
        );
        let destinations = table
            .destinations_for(&owned(&["b@y", "a@x", "e@y"]), Resolution::WithDefault)
            .unwrap();
        let names: Vec<&str> = destinations.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec![DEFAULT_DESTINATION, "D1"]);
        assert!(!table.is_captured("b@y"));
    }

    #[rstest]
    fn test_with_default_but_no_default(table: RoutingTable) {
        let result = table.destinations_for(&owned(&["b@y"]), Resolution::WithDefault);
        assert!(matches!(result, Err(Error::RoutingInvariant(_))));
    }
}
