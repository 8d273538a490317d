pub mod btree;
pub mod cond;
pub mod datum;
pub mod index;
pub mod open_option;
pub mod vector;

use crate::{storage::RelFileRef, OID};

use self::datum::RowLayout;

/// Static description of an index file: where it lives and what it stores.
///
/// For the B+tree driver `key` holds the key fields and `value` the value
/// fields (the last value field is the `UInt32` tuple id). The vector
/// driver is keyed by the tuple id directly, so `key` stays empty and
/// `value` describes the fixed-size slot.
#[derive(Clone)]
pub struct FileId {
    pub db: OID,
    pub rel_id: OID,
    pub key: RowLayout,
    pub value: RowLayout,
    pub unique: bool,
    pub top_null: bool,
}

impl FileId {
    pub fn file_ref(&self) -> RelFileRef {
        RelFileRef {
            db: self.db,
            rel_id: self.rel_id,
        }
    }

    pub fn field_count(&self) -> usize {
        self.key.len() + self.value.len()
    }

    /// Layout of a whole entry, key fields first.
    pub fn entry_layout(&self) -> RowLayout {
        let mut fields = self.key.fields().to_vec();
        fields.extend_from_slice(self.value.fields());
        RowLayout::new(fields)
    }
}
