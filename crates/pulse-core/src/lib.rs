//! # pulse-core
//!
//! Foundation types for the pulse progress-delivery service.
//!
//! This crate provides the shared vocabulary that the gateway and runtime
//! crates depend on:
//!
//! - **Branded IDs**: [`ids::UserId`], [`ids::RunId`], [`ids::ConnectionId`],
//!   [`ids::ThreadId`] as newtypes around opaque unique strings
//! - **Events**: [`events::CriticalEvent`] and the five critical progress
//!   payloads with their wire envelope
//! - **Retry**: [`retry::RetryConfig`] and backoff calculation
//! - **Configuration**: [`config::PulseConfig`] with layered loading
//! - **Logging**: [`logging::init_subscriber`] tracing bootstrap
//!
//! ## Crate Position
//!
//! Foundation crate. Depended on by `pulse-gateway` and `pulse-runtime`.

#![deny(unsafe_code)]

pub mod config;
pub mod events;
pub mod ids;
pub mod logging;
pub mod retry;
