//! chorus-core
//!
//! Durable, lease-based inference queue for long audio recordings.
//!
//! - **domain**: tasks, configs, subjects, detections, errors
//! - **ports**: store, media, classifier, clock and id traits
//! - **engine**: windowed streaming inference for one task
//! - **app**: lease coordinator, producer, worker pool, runtime, admin
//! - **impls**: in-memory and SQLite stores, WAV media, reference classifier

pub mod app;
pub mod domain;
pub mod engine;
pub mod impls;
pub mod ports;
