//! Filesystem primitives: atomic writes and archive handling.
//!
//! Config files the panel edits (httpd_config.conf, vhconf.conf, php.ini,
//! redis.conf) are always rewritten through `atomic`, so a crash mid-write
//! leaves the old file intact. `archive` covers the tar.gz and gzip work
//! for file backups and SQL dump compression.

pub mod archive;
pub mod atomic;
