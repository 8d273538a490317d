pub mod am;
pub mod plan;
pub mod storage;

mod bitset;
mod config;
mod db;
mod relation;
mod result;

mod test_util;

pub use self::{
    bitset::{TupleBitSet, TupleBitSetPtr},
    config::DBConfig,
    db::DB,
    relation::{Relation, RelationEntry, RelationKind},
    result::{Error, Result},
};

pub type OID = u64;
