// ============================================================================
// Producer Loop
// ============================================================================
//
// Generates an integer-counter message per tick and submits it through the
// delivery channel. States: Idle -> Sending -> (Idle | Backoff) -> Stopped.
//
// Backpressure: when the transport reports saturation the loop does NOT
// queue in memory; it stretches its interval exponentially (up to the
// backoff ceiling) and retries the SAME message, so ids stay monotonic and
// nothing is lost or buffered unboundedly.
//
// All waits are cancellable selects against the shutdown signal; an
// in-flight send is given the grace period before being abandoned.
//
// ============================================================================

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffPolicy;
use crate::channel::DeliveryChannel;
use crate::config::Config;
use crate::error::SendError;
use crate::message::{Message, MessageId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerState {
    Idle,
    Sending,
    Backoff,
    Stopped,
}

pub struct ProducerLoop {
    channel: Arc<DeliveryChannel>,
    interval: Duration,
    /// Interval stretching under sustained saturation
    saturation_backoff: BackoffPolicy,
    shutdown: watch::Receiver<bool>,
    grace: Duration,
    state: ProducerState,
    /// Next counter value; owned here, never process-global
    counter: u64,
    consecutive_saturations: u32,
    /// Message being retried after a saturation signal
    pending: Option<Message>,
}

impl ProducerLoop {
    pub fn new(channel: Arc<DeliveryChannel>, config: &Config, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            channel,
            interval: config.send_interval,
            saturation_backoff: BackoffPolicy::new(config.send_interval, config.backoff_ceiling),
            shutdown,
            grace: config.shutdown_grace,
            state: ProducerState::Idle,
            counter: 0,
            consecutive_saturations: 0,
            pending: None,
        }
    }

    /// Run until the shutdown signal fires. Returns the number of messages
    /// that reached a terminal outcome (sent or dead-lettered).
    pub async fn run(mut self) -> u64 {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "Producer loop started"
        );

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let wait = self.current_delay();
            tokio::select! {
                _ = self.shutdown.changed() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            self.transition(ProducerState::Sending);
            let message = self.take_message();

            let Some(result) = self.send_with_grace(&message).await else {
                // Shutdown fired mid-send and the grace period elapsed
                break;
            };

            match result {
                Ok(()) => {
                    self.counter += 1;
                    self.pending = None;
                    if self.consecutive_saturations > 0 {
                        info!(
                            ticks_saturated = self.consecutive_saturations,
                            "Transport recovered; resuming base interval"
                        );
                        self.consecutive_saturations = 0;
                    }
                    self.transition(ProducerState::Idle);
                }
                Err(SendError::Saturated { .. }) => {
                    self.consecutive_saturations += 1;
                    warn!(
                        message_id = %message.id,
                        consecutive = self.consecutive_saturations,
                        next_delay_ms = self.current_delay().as_millis() as u64,
                        "Transport saturated; stretching send interval"
                    );
                    self.pending = Some(message);
                    self.transition(ProducerState::Backoff);
                }
                Err(SendError::Terminal { attempts, reason }) => {
                    // Already dead-lettered by the channel; never silently
                    // dropped, but also never blocks the sequence
                    error!(
                        message_id = %message.id,
                        attempts = attempts,
                        reason = %reason,
                        "Send failed terminally; advancing to next message"
                    );
                    self.counter += 1;
                    self.pending = None;
                    self.consecutive_saturations = 0;
                    self.transition(ProducerState::Idle);
                }
            }
        }

        self.transition(ProducerState::Stopped);
        info!(produced = self.counter, "Producer loop stopped");
        self.counter
    }

    /// Base interval, or the stretched interval while saturated
    fn current_delay(&self) -> Duration {
        if self.consecutive_saturations == 0 {
            self.interval
        } else {
            self.saturation_backoff
                .delay_for(self.consecutive_saturations + 1)
        }
    }

    /// Next message: the saturation-retry if one is pending, else a fresh
    /// counter message. The counter advances only on terminal outcomes.
    fn take_message(&mut self) -> Message {
        self.pending.take().unwrap_or_else(|| {
            let payload = self.counter.to_string().into_bytes();
            Message::new(MessageId(self.counter), payload)
        })
    }

    /// Send, but if shutdown fires mid-flight only wait out the grace period
    async fn send_with_grace(&mut self, message: &Message) -> Option<Result<(), SendError>> {
        let channel = self.channel.clone();
        let send = channel.send(message);
        tokio::pin!(send);

        tokio::select! {
            result = &mut send => Some(result),
            _ = self.shutdown.changed() => {
                debug!(message_id = %message.id, "Shutdown during in-flight send; granting grace period");
                match tokio::time::timeout(self.grace, &mut send).await {
                    Ok(result) => Some(result),
                    Err(_) => {
                        warn!(
                            message_id = %message.id,
                            grace_ms = self.grace.as_millis() as u64,
                            "In-flight send abandoned after grace period"
                        );
                        None
                    }
                }
            }
        }
    }

    fn transition(&mut self, next: ProducerState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "Producer state transition");
            self.state = next;
        }
    }
}
