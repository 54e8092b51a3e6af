// Copyright 2024 The Mirrorlink Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures::stream::StreamExt;
use futures::Stream;
use mirrorlink_error::{make_err, Code, Error};
use rand::Rng;

type SleepFn = Box<dyn Fn(Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

pub enum RetryResult<T> {
    Ok(T),
    Retry(Error),
    Err(Error),
}

/// Drives a stream of attempts, sleeping between retryable failures.
/// The caller supplies the delay schedule as a plain `Iterator<Duration>`
/// so tests can pin the timing.
pub struct Retrier {
    sleep_fn: SleepFn,
}

impl Retrier {
    pub fn new(sleep_fn: SleepFn) -> Self {
        Retrier { sleep_fn }
    }

    pub fn retry<'a, T, Iter, S>(
        self: Pin<&'a Self>,
        mut duration_iter: Iter,
        operation: S,
    ) -> impl Future<Output = Result<T, Error>> + 'a
    where
        T: Send + 'a,
        Iter: Iterator<Item = Duration> + Send + 'a,
        S: Stream<Item = RetryResult<T>> + Send + Unpin + 'a,
    {
        let mut operation = operation;
        async move {
            loop {
                match operation.next().await {
                    None => {
                        return Err(make_err!(
                            Code::Internal,
                            "Retry stream ended abruptly",
                        ))
                    }
                    Some(RetryResult::Ok(value)) => return Ok(value),
                    Some(RetryResult::Err(e)) => return Err(e),
                    Some(RetryResult::Retry(e)) => match duration_iter.next() {
                        None => return Err(e),
                        Some(duration) => (self.sleep_fn)(duration).await,
                    },
                }
            }
        }
    }
}

/// Exponential backoff with jitter applied as a percentage of the
/// calculated delay. `max_retries` of zero yields no delays, meaning a
/// single attempt.
pub struct ExponentialBackoff {
    current: Duration,
    jitter: f32,
    remaining: usize,
}

impl ExponentialBackoff {
    pub fn new(delay: Duration, jitter: f32, max_retries: usize) -> Self {
        Self {
            current: delay,
            jitter,
            remaining: max_retries,
        }
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let delay = self.current;
        self.current = self.current.saturating_mul(2);
        if self.jitter <= 0.0 {
            return Some(delay);
        }
        let secs = delay.as_secs_f32();
        let jittered = rand::thread_rng()
            .gen_range(secs * (1.0 - self.jitter / 2.0)..=secs * (1.0 + self.jitter / 2.0));
        Some(Duration::from_secs_f32(jittered))
    }
}
