//! The contract between external sources and the run-coordination core.

use async_trait::async_trait;

use crate::error::ConnectorError;
use crate::publisher::Publisher;

/// Reads an external source and hands documents to the publisher.
///
/// Connectors do not own the publisher; they receive a handle and call
/// [`Publisher::publish`]. `execute` is expected to block until every
/// source record has been published or a fatal error is raised. The
/// runner drives one connector at a time and waits for all of its work to
/// be accounted before moving on.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connector name, used in logs and run summaries.
    fn name(&self) -> &str;

    /// Name of the pipeline this connector feeds.
    fn pipeline(&self) -> Option<&str>;

    /// Invoked before `execute`; may issue priming actions against the
    /// target system.
    async fn pre_execute(&self, _run_id: &str) -> Result<(), ConnectorError> {
        Ok(())
    }

    /// Read the source and publish every record.
    async fn execute(&self, publisher: Publisher) -> Result<(), ConnectorError>;

    /// Invoked after the run's work is complete; cleanup or commit actions
    /// against the target system.
    async fn post_execute(&self, _run_id: &str) -> Result<(), ConnectorError> {
        Ok(())
    }

    /// Release connector resources.
    async fn close(&self) -> Result<(), ConnectorError> {
        Ok(())
    }
}
