//! Restore loader crate.
//!
//! This crate implements the loader role of the backup-restore pipeline:
//! backup files are read through a `BackupSource`, chunked log payloads are
//! reassembled into versioned mutations, a sampling pass sizes applier key
//! ranges, and every mutation is routed to the applier that owns its key.
//! Higher layers supply the source, the applier sink and the coordinator
//! link, then drive batches through `Loader`.

pub mod restore;
