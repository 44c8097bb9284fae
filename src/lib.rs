//! service-lb-controller: cloud load balancers for Kubernetes Services
//!
//! This crate watches Services of type LoadBalancer together with Nodes and
//! Endpoints, and converges a cloud load balancer per Service through a
//! pluggable backend.

pub mod annotations;
pub mod cloud;
pub mod cluster;
pub mod config;
pub mod controller;
pub mod error;
pub mod leader;
pub mod telemetry;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::error::{Error, Result};
