//! Turns a directory tree read from the store into a [Snapshot].

use crate::endpoint::{CopyId, Registration};
use crate::schema::SchemaVersion;
use crate::snapshot::{CopyRecord, Snapshot};
use crate::store::Node;

use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{event, Level};

/// Name of the leaf holding a copy's registration, in the nested layout.
pub const REGISTRATION_LEAF: &str = "reg";

#[derive(Error, Debug)]
pub enum Error {
    #[error("Expected a directory at {key}")]
    NotADirectory { key: String },
}

/// Parses one of the two directory layouts.
///
/// The variant is picked once, from the [SchemaVersion] detected when the
/// resolver was created.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Parser {
    V1,
    V2,
}

impl From<SchemaVersion> for Parser {
    fn from(version: SchemaVersion) -> Self {
        match version {
            SchemaVersion::V1 => Parser::V1,
            SchemaVersion::V2 => Parser::V2,
        }
    }
}

impl Parser {
    /// Parses the service directory `root` into a snapshot.
    ///
    /// Copies which cannot be understood are logged and skipped; only a
    /// `root` which is not a directory fails the whole parse.
    pub fn parse(&self, root: &Node) -> Result<Snapshot, Error> {
        if !root.dir {
            return Err(Error::NotADirectory {
                key: root.key.clone(),
            });
        }

        let mut copies = BTreeMap::new();
        for node in &root.nodes {
            let Some(id) = CopyId::parse(node.name()) else {
                event!(Level::WARN, key = %node.key, "Skipping entry with invalid copy id");
                continue;
            };
            if copies.contains_key(&id) {
                event!(Level::WARN, key = %node.key, %id, "Skipping duplicate copy id");
                continue;
            }
            let registration = match self {
                Parser::V1 => parse_v1_copy(node),
                Parser::V2 => parse_v2_copy(node),
            };
            let Some(registration) = registration else {
                continue;
            };
            if registration.is_empty() {
                event!(
                    Level::WARN,
                    key = %node.key,
                    %id,
                    "Copy registered no processors; please check its deploy configuration"
                );
            }
            copies.insert(id, CopyRecord::new(id, registration));
        }

        if copies.is_empty() {
            event!(Level::WARN, key = %root.key, "No endpoints found");
        }
        Ok(Snapshot::new(copies.into_values()))
    }
}

// {copy id} = {processor: endpoint}
fn parse_v1_copy(node: &Node) -> Option<Registration> {
    if node.dir {
        event!(Level::WARN, key = %node.key, "Skipping copy: expected a value, found a directory");
        return None;
    }
    let value = node.value.as_deref().unwrap_or_default();
    event!(Level::TRACE, key = %node.key, value, "Parsing copy");
    match Registration::from_processor_map(value) {
        Ok(registration) => Some(registration),
        Err(err) => {
            event!(Level::WARN, key = %node.key, value, %err, "Skipping copy: invalid registration");
            None
        }
    }
}

// {copy id}/reg = {"servs": {processor: endpoint}}
fn parse_v2_copy(node: &Node) -> Option<Registration> {
    if !node.dir {
        event!(Level::WARN, key = %node.key, "Skipping copy: expected a directory, found a value");
        return None;
    }
    let Some(reg) = node.child(REGISTRATION_LEAF).filter(|reg| !reg.dir) else {
        event!(Level::WARN, key = %node.key, "Skipping copy: no registration");
        return None;
    };
    let value = reg.value.as_deref().unwrap_or_default();
    event!(Level::TRACE, key = %reg.key, value, "Parsing copy");
    match Registration::from_json(value) {
        Ok(registration) => Some(registration),
        Err(err) => {
            event!(Level::WARN, key = %reg.key, value, %err, "Skipping copy: invalid registration");
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::{endpoint, flat_json, nested_json, setup_tracing_subscriber};

    const ROOT_V1: &str = "/roc/dist/svc";
    const ROOT_V2: &str = "/roc/dist2/svc";

    fn v2_copy(name: &str, reg: &str) -> Node {
        Node::dir(
            format!("{ROOT_V2}/{name}"),
            vec![Node::leaf(format!("{ROOT_V2}/{name}/reg"), reg)],
        )
    }

    fn v1_copy(name: &str, value: &str) -> Node {
        Node::leaf(format!("{ROOT_V1}/{name}"), value)
    }

    #[test]
    fn v2_orders_endpoints_by_copy_id() {
        setup_tracing_subscriber();
        // Store order is not numeric order: "10" sorts before "2" as text.
        let root = Node::dir(
            ROOT_V2,
            vec![
                v2_copy("5", &nested_json(&[("p", "h5:1")])),
                v2_copy("10", &nested_json(&[("p", "h10:1")])),
                v2_copy("0", &nested_json(&[("p", "h0:1")])),
                v2_copy("2", &nested_json(&[("p", "h2:1")])),
            ],
        );
        let snapshot = Parser::V2.parse(&root).unwrap();
        assert_eq!(
            snapshot.endpoints("p"),
            &[
                endpoint("h0:1"),
                endpoint("h2:1"),
                endpoint("h5:1"),
                endpoint("h10:1"),
            ]
        );
        assert_eq!(
            snapshot.copies().keys().copied().collect::<Vec<_>>(),
            vec![CopyId(0), CopyId(2), CopyId(5), CopyId(10)]
        );
    }

    #[test]
    fn v2_skips_bad_copies() {
        setup_tracing_subscriber();
        let root = Node::dir(
            ROOT_V2,
            vec![
                v2_copy("0", &nested_json(&[("p", "h0:1")])),
                v2_copy("abc", &nested_json(&[("p", "bad-id:1")])),
                v2_copy("-1", &nested_json(&[("p", "negative:1")])),
                v2_copy("3", "{not json"),
                Node::dir(format!("{ROOT_V2}/4"), vec![]),
                Node::leaf(format!("{ROOT_V2}/5"), nested_json(&[("p", "leaf:1")])),
                Node::dir(
                    format!("{ROOT_V2}/6"),
                    vec![Node::dir(format!("{ROOT_V2}/6/reg"), vec![])],
                ),
                v2_copy("7", &nested_json(&[("p", "h7:1")])),
            ],
        );
        let snapshot = Parser::V2.parse(&root).unwrap();
        assert_eq!(snapshot.endpoints("p"), &[endpoint("h0:1"), endpoint("h7:1")]);
        assert_eq!(snapshot.copies().len(), 2);
    }

    #[test]
    fn v2_keeps_empty_registrations() {
        setup_tracing_subscriber();
        let root = Node::dir(
            ROOT_V2,
            vec![
                v2_copy("1", "{}"),
                v2_copy("2", &nested_json(&[("p", "h2:1")])),
            ],
        );
        let snapshot = Parser::V2.parse(&root).unwrap();
        assert_eq!(snapshot.copies().len(), 2);
        assert!(snapshot.copy(CopyId(1)).unwrap().registration.is_empty());
        assert_eq!(snapshot.endpoints("p"), &[endpoint("h2:1")]);
    }

    #[test]
    fn duplicate_copy_ids_keep_the_first() {
        setup_tracing_subscriber();
        let root = Node::dir(
            ROOT_V1,
            vec![
                v1_copy("07", &flat_json(&[("p", "first:1")])),
                v1_copy("7", &flat_json(&[("p", "second:1")])),
            ],
        );
        let snapshot = Parser::V1.parse(&root).unwrap();
        assert_eq!(snapshot.endpoints("p"), &[endpoint("first:1")]);
    }

    #[test]
    fn v1_skips_bad_copies() {
        setup_tracing_subscriber();
        let root = Node::dir(
            ROOT_V1,
            vec![
                v1_copy("x1", &flat_json(&[("p", "bad-id:1")])),
                v1_copy("1", &flat_json(&[("p", "h1:1")])),
                v1_copy("2", "[]"),
                Node::dir(format!("{ROOT_V1}/3"), vec![]),
                v1_copy("4", &flat_json(&[("p", "h4:1"), ("q", "h4:2")])),
            ],
        );
        let snapshot = Parser::V1.parse(&root).unwrap();
        assert_eq!(snapshot.endpoints("p"), &[endpoint("h1:1"), endpoint("h4:1")]);
        assert_eq!(snapshot.endpoints("q"), &[endpoint("h4:2")]);
        assert_eq!(snapshot.copies().len(), 2);
    }

    #[test]
    fn v1_and_v2_agree() {
        setup_tracing_subscriber();
        let copies: [(&str, &[(&str, &str)]); 3] = [
            ("0", &[("p", "h0:1"), ("q", "h0:2")]),
            ("2", &[("p", "h2:1")]),
            ("5", &[("q", "h5:2"), ("r", "h5:3")]),
        ];
        let v1 = Node::dir(
            ROOT_V1,
            copies
                .iter()
                .map(|(id, processors)| v1_copy(id, &flat_json(processors)))
                .collect(),
        );
        let v2 = Node::dir(
            ROOT_V2,
            copies
                .iter()
                .map(|(id, processors)| v2_copy(id, &nested_json(processors)))
                .collect(),
        );
        let v1 = Parser::V1.parse(&v1).unwrap();
        let v2 = Parser::V2.parse(&v2).unwrap();
        assert_eq!(v1.processors(), v2.processors());
        assert_eq!(v1, v2);
    }

    #[test]
    fn empty_directories_parse_to_empty_snapshots() {
        setup_tracing_subscriber();
        for parser in [Parser::V1, Parser::V2] {
            let snapshot = parser.parse(&Node::dir(ROOT_V2, vec![])).unwrap();
            assert!(snapshot.is_empty());
            assert!(snapshot.processors().is_empty());
        }
    }

    #[test]
    fn leaf_root_is_an_error() {
        setup_tracing_subscriber();
        for parser in [Parser::V1, Parser::V2] {
            let err = parser.parse(&Node::leaf(ROOT_V2, "{}")).unwrap_err();
            assert!(matches!(err, Error::NotADirectory { key } if key == ROOT_V2));
        }
    }

    #[test]
    fn parser_follows_schema_version() {
        assert_eq!(Parser::from(SchemaVersion::V1), Parser::V1);
        assert_eq!(Parser::from(SchemaVersion::V2), Parser::V2);
    }
}
