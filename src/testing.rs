//! Test doubles shared by the unit tests.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::TransportError;
use crate::http::{Request, Response};
use crate::network::Network;

#[derive(Debug, Clone)]
enum Outcome {
  Respond(u16, String),
  Fail,
}

/// A request the scripted network saw.
#[derive(Debug, Clone)]
pub struct RecordedCall {
  pub method: String,
  pub url: String,
  pub body: Option<String>,
  pub idempotency_key: Option<String>,
}

/// Network double answering from a script keyed by path (or full URL).
///
/// Unscripted URLs fail with a transport error. When several outcomes are
/// queued for one key they are used in order and the last one repeats.
#[derive(Default)]
pub struct ScriptedNetwork {
  script: Mutex<HashMap<String, VecDeque<Outcome>>>,
  calls: Mutex<Vec<RecordedCall>>,
  offline: Mutex<bool>,
  delay: Mutex<Option<Duration>>,
}

impl ScriptedNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn respond(&self, key: &str, status: u16, body: &str) {
    self.set(key, vec![Outcome::Respond(status, body.to_string())]);
  }

  pub fn fail(&self, key: &str) {
    self.set(key, vec![Outcome::Fail]);
  }

  /// Queue statuses for successive calls to `key`.
  pub fn respond_sequence(&self, key: &str, statuses: &[u16]) {
    let outcomes = statuses
      .iter()
      .map(|s| Outcome::Respond(*s, "{}".to_string()))
      .collect();
    self.set(key, outcomes);
  }

  pub fn set_offline(&self, offline: bool) {
    *self.offline.lock().unwrap() = offline;
  }

  pub fn set_delay(&self, delay: Duration) {
    *self.delay.lock().unwrap() = Some(delay);
  }

  pub fn calls(&self) -> Vec<RecordedCall> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self) -> usize {
    self.calls.lock().unwrap().len()
  }

  fn set(&self, key: &str, outcomes: Vec<Outcome>) {
    self
      .script
      .lock()
      .unwrap()
      .insert(key.to_string(), outcomes.into());
  }

  fn next_outcome(&self, request: &Request) -> Outcome {
    if *self.offline.lock().unwrap() {
      return Outcome::Fail;
    }

    let mut script = self.script.lock().unwrap();
    let key = if script.contains_key(request.url.as_str()) {
      request.url.as_str()
    } else {
      request.url.path()
    };
    let queue = script.get_mut(key);

    match queue {
      Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(Outcome::Fail),
      Some(queue) => queue.front().cloned().unwrap_or(Outcome::Fail),
      None => Outcome::Fail,
    }
  }
}

#[async_trait]
impl Network for ScriptedNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, TransportError> {
    self.calls.lock().unwrap().push(RecordedCall {
      method: request.method.to_string(),
      url: request.url.to_string(),
      body: request
        .body
        .as_ref()
        .map(|b| String::from_utf8_lossy(b).into_owned()),
      idempotency_key: request.header("Idempotency-Key").map(String::from),
    });

    let delay = *self.delay.lock().unwrap();
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }

    match self.next_outcome(request) {
      Outcome::Respond(status, body) => {
        Ok(Response::new(request.url.as_str(), status, body.into_bytes()))
      }
      Outcome::Fail => Err(TransportError::new(request.url.as_str(), "connection refused")),
    }
  }
}
