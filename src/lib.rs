//! Probeguard - rate-limited front end for an external endpoint prober
//!
//! This crate accepts probe requests over HTTP, admits them through an
//! adaptive, bounded-memory rate limiter composed across several policies
//! (source subnet, probe target, global) and forwards admitted requests to an
//! external prober, translating its metrics output into JSON.

pub mod api;
pub mod config;
pub mod error;
pub mod prober;
pub mod ratelimit;
