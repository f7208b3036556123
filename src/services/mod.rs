//! Domain services: content storage, metadata, access control.

pub mod auth;
pub mod ip_filter;
pub mod locks;
pub mod metadata;
pub mod rate_limiter;
pub mod storage;
pub mod transfer_service;
