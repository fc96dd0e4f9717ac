// used for persistence
use rusqlite::{params, Connection, OptionalExtension, Statement};
use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, info};

use crate::attribute::Attribute;
use crate::config::PersistenceMode;
use crate::construct::{Icn, Item};
use crate::datatype::{Composition, ScalarClass, Value};
use crate::error::{DBError, Result};
use crate::store::{Overlay, Store, StoreView};

const LAST_ICN: &str = "last_icn";
const LAST_ITEM: &str = "last_item";

/// Opens the SQLite connection for a persistence mode.
pub fn open(mode: &PersistenceMode, busy_timeout: Duration) -> Result<Connection> {
    let connection = match mode {
        PersistenceMode::InMemory => Connection::open_in_memory()?,
        PersistenceMode::File(path) => Connection::open(path)?,
    };
    connection.busy_timeout(busy_timeout)?;
    if let PersistenceMode::File(path) = mode {
        // WAL keeps commits cheap; in-memory databases do not support it
        let journal: String = connection.query_row("pragma journal_mode = wal", [], |r| r.get(0))?;
        debug!(path = %path.display(), journal, "opened database file");
    }
    Ok(connection)
}

fn corrupt(message: String) -> DBError {
    DBError::DataCorruption { message }
}

// ------------- Persistence -------------
pub struct Persistor<'db> {
    db: &'db Connection,
    // Writers
    put_item: Statement<'db>,
    put_value: Statement<'db>,
    delete_value: Statement<'db>,
    put_attribute: Statement<'db>,
    put_identity: Statement<'db>,
    delete_identity: Statement<'db>,
    put_property: Statement<'db>,
    delete_item: Statement<'db>,
    // Readers
    get_property: Statement<'db>,
}

impl<'db> Persistor<'db> {
    pub fn new(connection: &'db Connection) -> Result<Persistor<'db>> {
        connection.execute_batch(
            "
            create table if not exists Item (
                Item_Identity integer not null,
                Alive integer not null,
                Last_ICN integer not null,
                constraint unique_and_referenceable_Item_Identity primary key (
                    Item_Identity
                )
            );
            create table if not exists Attribute (
                Attribute_Id text not null,
                Name text not null,
                ScalarClass_Identity integer not null,
                Composition text not null,
                Propagating integer not null,
                constraint referenceable_Attribute_Id primary key (
                    Attribute_Id
                )
            );
            create table if not exists AttributeValue (
                Item_Identity integer not null,
                Attribute_Id text not null,
                Value text not null,
                constraint Value_of_Attribute foreign key (
                    Attribute_Id
                ) references Attribute(Attribute_Id),
                constraint unique_AttributeValue primary key (
                    Item_Identity,
                    Attribute_Id
                )
            );
            create table if not exists Identity (
                Identity text not null,
                Item_Identity integer not null,
                constraint unique_Identity primary key (
                    Identity
                )
            );
            create table if not exists Property (
                Name text not null,
                Value integer not null,
                constraint unique_Property primary key (
                    Name
                )
            );
            ",
        )?;
        Ok(Persistor {
            db: connection,
            put_item: connection.prepare(
                "
                insert or replace into Item (
                    Item_Identity,
                    Alive,
                    Last_ICN
                ) values (?, ?, ?)
            ",
            )?,
            put_value: connection.prepare(
                "
                insert or replace into AttributeValue (
                    Item_Identity,
                    Attribute_Id,
                    Value
                ) values (?, ?, ?)
            ",
            )?,
            delete_value: connection.prepare(
                "
                delete from AttributeValue
                    where Item_Identity = ?
                    and Attribute_Id = ?
            ",
            )?,
            put_attribute: connection.prepare(
                "
                insert or ignore into Attribute (
                    Attribute_Id,
                    Name,
                    ScalarClass_Identity,
                    Composition,
                    Propagating
                ) values (?, ?, ?, ?, ?)
            ",
            )?,
            put_identity: connection.prepare(
                "
                insert or replace into Identity (
                    Identity,
                    Item_Identity
                ) values (?, ?)
            ",
            )?,
            delete_identity: connection.prepare(
                "
                delete from Identity
                    where Identity = ?
            ",
            )?,
            put_property: connection.prepare(
                "
                insert or replace into Property (
                    Name,
                    Value
                ) values (?, ?)
            ",
            )?,
            delete_item: connection.prepare(
                "
                delete from Item
                    where Item_Identity = ?
                    and Alive = 0
            ",
            )?,
            get_property: connection.prepare(
                "
                select Value
                    from Property
                    where Name = ?
            ",
            )?,
        })
    }

    /// Writes one commit in a single SQLite transaction. Nothing is written
    /// when any statement fails.
    pub fn persist(&mut self, icn: Icn, overlay: &Overlay, store: &Store) -> Result<()> {
        let tx = self.db.unchecked_transaction()?;
        for attribute in overlay.new_attributes() {
            self.put_attribute.execute(params![
                attribute.id(),
                attribute.name(),
                attribute.scalar_class().identifier(),
                attribute.composition().name(),
                attribute.is_propagating()
            ])?;
        }
        for (item, attribute, value) in overlay.values() {
            match value {
                Some(value) => {
                    let json = serde_json::to_string(value)?;
                    self.put_value.execute(params![item, attribute.id(), json])?;
                }
                None => {
                    self.delete_value.execute(params![item, attribute.id()])?;
                }
            }
        }
        let alive: BTreeMap<Item, bool> = overlay.alive_changes().collect();
        for &item in overlay.changed() {
            let is_alive = alive.get(&item).copied().unwrap_or_else(|| store.is_alive(item));
            self.put_item.execute(params![item, is_alive, icn])?;
        }
        for (identity, item) in overlay.identity_changes() {
            if item == 0 {
                self.delete_identity.execute(params![identity])?;
            } else {
                self.put_identity.execute(params![identity, item])?;
            }
        }
        self.put_property.execute(params![LAST_ICN, icn])?;
        self.put_property.execute(params![LAST_ITEM, overlay.last_item()])?;
        tx.commit()?;
        Ok(())
    }

    fn property(&mut self, name: &str) -> Result<u64> {
        let value: Option<u64> = self
            .get_property
            .query_row(params![name], |r| r.get(0))
            .optional()?;
        Ok(value.unwrap_or(0))
    }

    /// Loads everything persisted into an empty store.
    pub fn restore(&mut self, store: &mut Store) -> Result<()> {
        let mut catalog: BTreeMap<String, Attribute> = BTreeMap::new();
        {
            let mut statement = self.db.prepare(
                "
                select Attribute_Id, Name, ScalarClass_Identity, Composition, Propagating
                    from Attribute
            ",
            )?;
            let mut rows = statement.query([])?;
            while let Some(row) = rows.next()? {
                let id: String = row.get(0)?;
                let name: String = row.get(1)?;
                let scalar_uid: u8 = row.get(2)?;
                let composition: String = row.get(3)?;
                let propagating: bool = row.get(4)?;
                let scalar = ScalarClass::from_identifier(scalar_uid)
                    .ok_or_else(|| corrupt(format!("attribute {} has unknown scalar class {}", id, scalar_uid)))?;
                let composition = Composition::from_name(&composition)
                    .ok_or_else(|| corrupt(format!("attribute {} has unknown composition {}", id, composition)))?;
                if propagating && scalar != ScalarClass::Link {
                    return Err(corrupt(format!("attribute {} propagates but is not a link", id)));
                }
                let attribute = Attribute::new(&id, &name, scalar, composition, propagating);
                store.keep_attribute(attribute.clone());
                catalog.insert(id, attribute);
            }
        }
        let mut values = 0usize;
        {
            let mut statement = self.db.prepare(
                "
                select Item_Identity, Attribute_Id, Value
                    from AttributeValue
            ",
            )?;
            let mut rows = statement.query([])?;
            while let Some(row) = rows.next()? {
                let item: Item = row.get(0)?;
                let id: String = row.get(1)?;
                let json: String = row.get(2)?;
                let attribute = catalog
                    .get(&id)
                    .ok_or_else(|| corrupt(format!("value of unknown attribute {} on item {}", id, item)))?;
                let value: Value = serde_json::from_str(&json)?;
                if !attribute.accepts(&value) {
                    return Err(corrupt(format!("{} can not hold the value {} of item {}", attribute, value, item)));
                }
                store.put_value(item, attribute, Some(value));
                values += 1;
            }
        }
        {
            let mut statement = self.db.prepare(
                "
                select Item_Identity, Alive, Last_ICN
                    from Item
            ",
            )?;
            let mut rows = statement.query([])?;
            while let Some(row) = rows.next()? {
                let item: Item = row.get(0)?;
                let alive: bool = row.get(1)?;
                let last_icn: Icn = row.get(2)?;
                store.set_alive(item, alive);
                store.touch(item, last_icn);
            }
        }
        {
            let mut statement = self.db.prepare(
                "
                select Identity, Item_Identity
                    from Identity
            ",
            )?;
            let mut rows = statement.query([])?;
            while let Some(row) = rows.next()? {
                let identity: String = row.get(0)?;
                let item: Item = row.get(1)?;
                store.bind_identity(identity.into(), item);
            }
        }
        let icn = self.property(LAST_ICN)?;
        let last_item = self.property(LAST_ITEM)?;
        store.restore_counters(icn, last_item);
        info!(
            icn,
            items = store.alive_count(),
            values,
            attributes = catalog.len(),
            "restored database"
        );
        Ok(())
    }

    /// Drops the bookkeeping rows of cleared items.
    pub fn purge(&mut self, items: &[Item]) -> Result<usize> {
        if items.is_empty() {
            return Ok(0);
        }
        let tx = self.db.unchecked_transaction()?;
        let mut purged = 0;
        for item in items {
            purged += self.delete_item.execute(params![item])?;
        }
        tx.commit()?;
        Ok(purged)
    }

    /// Rebuilds planner statistics. Safe to repeat.
    pub fn optimize(&mut self) -> Result<()> {
        self.db.execute_batch("analyze; pragma optimize;")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{DBWriter, TransactionWriter};

    #[test]
    fn commits_survive_a_restore() {
        let connection = Connection::open_in_memory().unwrap();
        let mut persistor = Persistor::new(&connection).unwrap();
        let mut store = Store::new();
        let title = Attribute::string("test:title", "Title");
        let mut writer = TransactionWriter::new(&store);
        let item = writer.next_item();
        writer.set_value(item, &title, Value::from("persisted"));
        let icn = writer.transaction_icn();
        let overlay = writer.into_overlay();
        persistor.persist(icn, &overlay, &store).unwrap();
        store.apply(overlay, icn);

        let mut restored = Store::new();
        persistor.restore(&mut restored).unwrap();
        assert_eq!(restored.icn(), icn);
        assert_eq!(restored.value(item, &title), Some(&Value::from("persisted")));
        assert_eq!(restored.last_item(), store.last_item());
        assert_eq!(restored.attribute("test:title"), Some(title));
        assert!(restored.changed_since(icn).contains(&item));
    }

    #[test]
    fn unreadable_values_are_reported() {
        let connection = Connection::open_in_memory().unwrap();
        let mut persistor = Persistor::new(&connection).unwrap();
        connection
            .execute_batch(
                "
                insert into Attribute values ('test:n', 'N', 1, 'Scalar', 0);
                insert into AttributeValue values (1, 'test:n', 'not json');
            ",
            )
            .unwrap();
        let mut store = Store::new();
        let error = persistor.restore(&mut store).unwrap_err();
        assert!(matches!(error, DBError::DataCorruption { .. }));
    }
}
