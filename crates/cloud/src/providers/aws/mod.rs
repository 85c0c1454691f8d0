//! AWS adapters.
//!
//! [`Aws`] implements every backend trait:
//!
//! - **ECS** - [`ComputeBackend`](super::ComputeBackend) (JSON 1.1)
//! - **EC2** - [`StorageBackend`](super::StorageBackend) for EBS volumes and snapshots (Query/XML)
//! - **Route 53** - [`DnsBackend`](super::DnsBackend) (REST-XML)
//! - **ELBv2** - [`LoadBalancerBackend`](super::LoadBalancerBackend) (Query/XML)
//! - **DynamoDB** - [`LockBackend`](super::LockBackend) (JSON 1.0)
//!
//! Requests are signed with SigV4 from static credentials.

mod client;
mod dynamodb;
mod ec2;
mod ecs;
mod elbv2;
mod models;
mod route53;
mod sigv4;

pub use client::{Aws, Service};
pub use sigv4::Credentials;
