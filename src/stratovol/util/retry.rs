/*
 * Copyright (C) 2025 The Stratovol Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Bounded polling shared by the volume-state and device-appearance waits.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

/// Result of a single probe: the awaited value, or an observation to carry
/// into the timeout error if polling never succeeds.
pub enum PollOutcome<T, P> {
    Ready(T),
    Pending(P),
}

#[derive(Debug)]
pub enum PollError<P, E> {
    /// All attempts exhausted. `last` is the most recent Pending
    /// observation, so callers can report the final observed state rather
    /// than the state they were hoping for.
    Timeout { attempts: u32, last: Option<P> },
    /// The probe itself failed; polling stops immediately.
    Failed(E),
}

/// Runs `probe` up to `attempts` times, sleeping `interval` between
/// attempts. The first probe runs without delay.
pub async fn poll_until<T, P, E, F, Fut>(
    interval: Duration,
    attempts: u32,
    mut probe: F,
) -> Result<T, PollError<P, E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<PollOutcome<T, P>, E>>,
{
    let mut last = None;
    for attempt in 0..attempts {
        if attempt > 0 {
            sleep(interval).await;
        }
        match probe().await {
            Ok(PollOutcome::Ready(value)) => return Ok(value),
            Ok(PollOutcome::Pending(observed)) => last = Some(observed),
            Err(err) => return Err(PollError::Failed(err)),
        }
    }
    Err(PollError::Timeout { attempts, last })
}
