//! A thin filter/take query builder over one snapshot.

use crate::codec::Value;
use crate::error::CResult;
use crate::mvcc::snapshot::{Attributes, Database};

/// Builds a filtered enumeration of a snapshot's entities. Obtained from
/// `Database::query()`; every read goes through the pinned snapshot, never
/// the live store, so results are stable regardless of concurrent commits.
pub struct Query {
    db: Database,
    filters: Vec<Box<dyn Fn(&str, &Attributes) -> bool>>,
    take: Option<usize>,
}

impl Query {
    pub(crate) fn new(db: Database) -> Query {
        Query { db, filters: Vec::new(), take: None }
    }

    /// Adds a predicate over `(entity_id, attributes)`. Predicates conjoin.
    pub fn filter(mut self, predicate: impl Fn(&str, &Attributes) -> bool + 'static) -> Query {
        self.filters.push(Box::new(predicate));
        self
    }

    /// Keeps entities holding `value` under `attribute`: scalar equality, or
    /// collection membership.
    pub fn with_value(self, attribute: &str, value: Value) -> Query {
        let attribute = attribute.to_string();
        self.filter(move |_, attrs| {
            attrs.get(&attribute).is_some_and(|attr| attr.contains(&value))
        })
    }

    /// Caps the number of results.
    pub fn take(mut self, n: usize) -> Query {
        self.take = Some(n);
        self
    }

    /// Runs the query: entities in id order, each with its resolved
    /// attributes, filtered and capped.
    pub fn run(self) -> CResult<Vec<(String, Attributes)>> {
        let mut results = Vec::new();
        for entity_id in self.db.entities()? {
            let attrs = self.db.attributes(&entity_id)?;
            // Fully removed entities resolve empty and are not matches.
            if attrs.is_empty() {
                continue;
            }
            if self.filters.iter().all(|predicate| predicate(&entity_id, &attrs)) {
                results.push((entity_id, attrs));
                if self.take.is_some_and(|n| results.len() >= n) {
                    break;
                }
            }
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::AttrType;
    use crate::mvcc::snapshot::AttributeValue;
    use crate::store::Store;
    use pretty_assertions::assert_eq;

    fn setup() -> CResult<Store> {
        let store = Store::open_in_memory()?;
        let t = store.transactor();
        t.add_attribute("age", AttrType::Integer, false)?;
        t.add_attribute("tags", AttrType::String, true)?;

        t.add_value(&Value::Integer(30), "age", "alice")?;
        t.add_value(&Value::from("admin"), "tags", "alice")?;
        t.add_value(&Value::Integer(30), "age", "bob")?;
        t.add_value(&Value::Integer(40), "age", "carol")?;
        Ok(store)
    }

    #[test]
    fn filter_and_take() -> CResult<()> {
        let store = setup()?;
        let db = store.current_database()?;

        let thirty = db
            .query()
            .filter(|_, attrs| {
                attrs.get("age").is_some_and(|age| age.contains(&Value::Integer(30)))
            })
            .run()?;
        assert_eq!(
            thirty.iter().map(|(id, _)| id.as_str()).collect::<Vec<_>>(),
            vec!["alice", "bob"]
        );

        let capped = db.query().take(2).run()?;
        assert_eq!(capped.len(), 2);
        Ok(())
    }

    #[test]
    fn with_value_matches_scalars_and_collections() -> CResult<()> {
        let store = setup()?;
        let db = store.current_database()?;

        let admins = db.query().with_value("tags", Value::from("admin")).run()?;
        assert_eq!(admins.len(), 1);
        assert_eq!(admins[0].0, "alice");
        assert_eq!(admins[0].1["age"], AttributeValue::Scalar(Value::Integer(30)));

        let forty = db.query().with_value("age", Value::Integer(40)).run()?;
        assert_eq!(forty[0].0, "carol");

        assert!(db.query().with_value("age", Value::Integer(99)).run()?.is_empty());
        Ok(())
    }

    #[test]
    fn queries_pin_their_snapshot() -> CResult<()> {
        let store = setup()?;
        let db = store.current_database()?;

        // Mutations after the snapshot do not leak into its queries.
        store.transactor().add_value(&Value::Integer(30), "age", "dave")?;
        let thirty = db.query().with_value("age", Value::Integer(30)).run()?;
        assert_eq!(
            thirty.iter().map(|(id, _)| id.as_str()).collect::<Vec<_>>(),
            vec!["alice", "bob"]
        );
        Ok(())
    }

    #[test]
    fn removed_entities_disappear() -> CResult<()> {
        let store = setup()?;
        let t = store.transactor();
        t.remove_value(None, "age", "bob")?;

        let db = store.current_database()?;
        let thirty = db.query().with_value("age", Value::Integer(30)).run()?;
        assert_eq!(
            thirty.iter().map(|(id, _)| id.as_str()).collect::<Vec<_>>(),
            vec!["alice"]
        );
        Ok(())
    }
}
