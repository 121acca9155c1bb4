//! Parsers and editors for the config files the panel manages.
//!
//! `directive` handles flat `name value` files (redis.conf), `ini`
//! handles php.ini, and `olsconf` patches OpenLiteSpeed's block-style
//! httpd_config.conf and per-vhost vhconf.conf. All three preserve the
//! parts of the file they do not touch; rewrites go through
//! `fs::atomic`.

pub mod directive;
pub mod ini;
pub mod olsconf;
