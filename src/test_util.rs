#![cfg(test)]

use crate::{storage::StorageManager, DBConfig, DB};

use std::sync::Once;

static INIT: Once = Once::new();

pub fn init_log() {
    INIT.call_once(|| {
        use env_logger::Builder;

        let _ = Builder::from_default_env().is_test(true).try_init();
    });
}

pub fn get_temp_smgr() -> (StorageManager, tempfile::TempDir) {
    let db_dir = tempfile::tempdir().unwrap();
    let smgr = StorageManager::new(&db_dir.path());
    smgr.lock_base().unwrap();

    (smgr, db_dir)
}

pub fn get_temp_db() -> (DB, tempfile::TempDir) {
    init_log();

    let db_dir = tempfile::tempdir().unwrap();
    let config = DBConfig::new().root_path(&db_dir.path());
    let db = DB::open(config).unwrap();

    (db, db_dir)
}
