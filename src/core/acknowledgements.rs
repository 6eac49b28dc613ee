use std::sync::Arc;

use async_trait::async_trait;
use lapin::acker::Acker;
use lapin::options::{BasicNackOptions, BasicRejectOptions};
use lapin::BasicProperties;
use tracing::{debug, error};

use crate::core::message::DeliveryInfo;

/// A failed delivery, as seen by the acknowledgement policies.
///
/// The acker belongs to the channel the message arrived on, so whatever a
/// policy decides is issued on the right channel.
pub struct FailureContext<'a> {
    pub consumer: &'a str,
    pub delivery: &'a DeliveryInfo,
    pub properties: &'a BasicProperties,
    pub acker: &'a Acker,
    pub error: &'a anyhow::Error,
}

/// One link of the failure-acknowledgement chain.
///
/// A policy that takes the decision issues the broker call itself (ack, nack,
/// requeue or reject) and returns `true`; returning `false` defers to the
/// next policy.
#[async_trait]
pub trait AcknowledgementPolicy: Send + Sync {
    async fn handle(&self, failure: &FailureContext<'_>) -> Result<bool, lapin::Error>;
}

/// Terminal policy: nack without requeue, always claims.
pub struct NackOnAllFailures;

#[async_trait]
impl AcknowledgementPolicy for NackOnAllFailures {
    async fn handle(&self, failure: &FailureContext<'_>) -> Result<bool, lapin::Error> {
        failure
            .acker
            .nack(BasicNackOptions {
                requeue: false,
                ..Default::default()
            })
            .await?;
        Ok(true)
    }
}

/// Requeues the failed delivery once: a redelivered message falls through to
/// the next policy instead of looping forever.
pub struct RequeueOnce;

#[async_trait]
impl AcknowledgementPolicy for RequeueOnce {
    async fn handle(&self, failure: &FailureContext<'_>) -> Result<bool, lapin::Error> {
        if failure.delivery.redelivered {
            return Ok(false);
        }
        failure
            .acker
            .reject(BasicRejectOptions { requeue: true })
            .await?;
        Ok(true)
    }
}

/// Ordered, immutable chain of policies walked first-claim-wins.
///
/// Whatever the configured policies do, a delivery never goes unanswered: if
/// nothing claims (or a policy fails mid-call), the chain falls back to a
/// plain nack without requeue.
pub struct AcknowledgementChain {
    policies: Vec<Arc<dyn AcknowledgementPolicy>>,
}

impl AcknowledgementChain {
    pub fn new(policies: Vec<Arc<dyn AcknowledgementPolicy>>) -> Self {
        Self { policies }
    }

    pub async fn run(&self, failure: &FailureContext<'_>) {
        for (position, policy) in self.policies.iter().enumerate() {
            match policy.handle(failure).await {
                Ok(true) => {
                    debug!(
                        consumer = %failure.consumer,
                        delivery_tag = failure.delivery.delivery_tag,
                        position,
                        "acknowledgement policy claimed the failure"
                    );
                    return;
                }
                Ok(false) => continue,
                Err(error) => {
                    error!(
                        ?error,
                        consumer = %failure.consumer,
                        delivery_tag = failure.delivery.delivery_tag,
                        position,
                        "acknowledgement policy failed, falling through"
                    );
                    continue;
                }
            }
        }

        if let Err(error) = failure
            .acker
            .nack(BasicNackOptions {
                requeue: false,
                ..Default::default()
            })
            .await
        {
            error!(
                ?error,
                consumer = %failure.consumer,
                delivery_tag = failure.delivery.delivery_tag,
                "failed to nack unclaimed failure"
            );
        }
    }
}

impl Default for AcknowledgementChain {
    fn default() -> Self {
        Self::new(vec![Arc::new(NackOnAllFailures)])
    }
}
