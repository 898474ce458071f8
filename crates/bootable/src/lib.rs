//! Abstract interfaces for the units of work the orchestrator drives.
//!
//! Services brought up from the dependency graph implement [`Bootable`].
//! Startup steps and rollback strategies are backed by an [`Action`] plus a
//! [`HealthCheck`]. Concrete implementations are looked up by id through a
//! [`Registry`].
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod registry;

pub use registry::Registry;

use std::future::Future;

use async_trait::async_trait;

/// Boxed error returned across the boundary by opaque units of work.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Trait for bootable services.
#[async_trait]
pub trait Bootable
where
    Self: Send + Sync + 'static,
{
    /// Get the name of the bootable service.
    fn name(&self) -> &str;

    /// Start the bootable service.
    async fn start(&self) -> Result<(), BoxError>;

    /// Shutdown the bootable service.
    async fn shutdown(&self) -> Result<(), BoxError>;

    /// Whether the service currently reports itself healthy.
    async fn is_healthy(&self) -> bool;
}

/// An opaque unit of work that either succeeds or fails.
#[async_trait]
pub trait Action
where
    Self: Send + Sync,
{
    /// Run the action once.
    async fn invoke(&self) -> Result<(), BoxError>;
}

/// An opaque health predicate.
#[async_trait]
pub trait HealthCheck
where
    Self: Send + Sync,
{
    /// Evaluate the predicate once.
    async fn check(&self) -> bool;
}

/// [`Action`] backed by an async closure.
pub struct FnAction<F>(F);

impl<F> FnAction<F> {
    /// Wraps a closure producing the action's future.
    pub const fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> Action for FnAction<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BoxError>> + Send,
{
    async fn invoke(&self) -> Result<(), BoxError> {
        (self.0)().await
    }
}

/// [`HealthCheck`] backed by an async closure.
pub struct FnHealthCheck<F>(F);

impl<F> FnHealthCheck<F> {
    /// Wraps a closure producing the predicate's future.
    pub const fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> HealthCheck for FnHealthCheck<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = bool> + Send,
{
    async fn check(&self) -> bool {
        (self.0)().await
    }
}

/// Health check that always passes.
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysHealthy;

#[async_trait]
impl HealthCheck for AlwaysHealthy {
    async fn check(&self) -> bool {
        true
    }
}

/// Action that does nothing and succeeds.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopAction;

#[async_trait]
impl Action for NoopAction {
    async fn invoke(&self) -> Result<(), BoxError> {
        Ok(())
    }
}
