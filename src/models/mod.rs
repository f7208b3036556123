//! Core data models for the transfer service.
//!
//! A resource is addressed by the pair (token, filename). Its bytes live in a
//! storage backend, its access policy in a [`metadata::Metadata`] record.

pub mod metadata;
pub mod resource;
