//! Scripted transport for tests

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::oneshot;

use super::{HttpResponse, Transport};
use crate::error::{Error, Result};

/// A request seen by [`ScriptedTransport`]
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub method: &'static str,
    pub url: String,
    pub body: Option<serde_json::Value>,
}

enum Scripted {
    Respond(HttpResponse),
    Fail(String),
    Hold {
        entered: oneshot::Sender<()>,
        release: oneshot::Receiver<()>,
        then: HttpResponse,
    },
}

struct Route {
    fragment: String,
    queue: VecDeque<Scripted>,
    fallback: Option<HttpResponse>,
}

/// Handles for a request parked by [`ScriptedTransport::hold`]
pub struct HeldRequest {
    /// Resolves once the request has reached the transport
    pub entered: oneshot::Receiver<()>,
    /// Send to let the request complete
    pub release: oneshot::Sender<()>,
}

/// Transport that answers from per-URL scripts
///
/// Routes match when the request URL contains the route's fragment; the
/// first matching route with a queued answer or a fallback wins. Unmatched
/// requests fail like a network error.
#[derive(Default)]
pub struct ScriptedTransport {
    routes: Mutex<Vec<Route>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, fragment: &str, scripted: Scripted) {
        let mut routes = self.routes.lock().unwrap();
        if let Some(route) = routes.iter_mut().find(|r| r.fragment == fragment) {
            route.queue.push_back(scripted);
        } else {
            routes.push(Route {
                fragment: fragment.to_string(),
                queue: VecDeque::from([scripted]),
                fallback: None,
            });
        }
    }

    /// Answer the next matching request with `response`
    pub fn respond(&self, fragment: &str, response: HttpResponse) {
        self.push(fragment, Scripted::Respond(response));
    }

    /// Fail the next matching request with a transport error
    pub fn fail(&self, fragment: &str) {
        self.push(fragment, Scripted::Fail(format!("connection to {} refused", fragment)));
    }

    /// Answer every matching request with `response` once its queue is empty
    pub fn always(&self, fragment: &str, response: HttpResponse) {
        let mut routes = self.routes.lock().unwrap();
        if let Some(route) = routes.iter_mut().find(|r| r.fragment == fragment) {
            route.fallback = Some(response);
        } else {
            routes.push(Route {
                fragment: fragment.to_string(),
                queue: VecDeque::new(),
                fallback: Some(response),
            });
        }
    }

    /// Park the next matching request until released, then answer with `then`
    pub fn hold(&self, fragment: &str, then: HttpResponse) -> HeldRequest {
        let (entered_tx, entered_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel();
        self.push(
            fragment,
            Scripted::Hold {
                entered: entered_tx,
                release: release_rx,
                then,
            },
        );
        HeldRequest {
            entered: entered_rx,
            release: release_tx,
        }
    }

    /// Every request seen so far
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Requests whose URL contains `fragment`
    pub fn requests_to(&self, fragment: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.url.contains(fragment))
            .collect()
    }

    async fn answer(
        &self,
        method: &'static str,
        url: &str,
        body: Option<serde_json::Value>,
    ) -> Result<HttpResponse> {
        self.requests.lock().unwrap().push(RecordedRequest {
            method,
            url: url.to_string(),
            body,
        });

        let scripted = {
            let mut routes = self.routes.lock().unwrap();
            let mut found = None;
            for route in routes.iter_mut().filter(|r| url.contains(&r.fragment)) {
                if let Some(next) = route.queue.pop_front() {
                    found = Some(next);
                    break;
                }
                if let Some(fallback) = &route.fallback {
                    found = Some(Scripted::Respond(fallback.clone()));
                    break;
                }
            }
            found
        };

        match scripted {
            Some(Scripted::Respond(response)) => Ok(response),
            Some(Scripted::Fail(message)) => Err(Error::Http(message)),
            Some(Scripted::Hold {
                entered,
                release,
                then,
            }) => {
                let _ = entered.send(());
                let _ = release.await;
                Ok(then)
            }
            None => Err(Error::Http(format!("no scripted response for {}", url))),
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn get(&self, url: &str) -> Result<HttpResponse> {
        self.answer("GET", url, None).await
    }

    async fn post_json(&self, url: &str, body: &serde_json::Value) -> Result<HttpResponse> {
        self.answer("POST", url, Some(body.clone())).await
    }
}
