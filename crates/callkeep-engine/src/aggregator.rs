//! Call State Aggregator.
//!
//! Merges the established, outgoing and answering call lists of one session
//! into a single stream of candidates. Ordering of the concatenated list is
//! the source order, so an established call is always shown before an
//! outgoing one, and an outgoing one before the call being answered.

use std::pin::Pin;
use std::task::{Context, Poll};

use callkeep_core::{
    Call, CallError, ConversationId, Decision, LiveStream, NotificationData, StopReason, UserId,
};
use futures::{stream, Stream, StreamExt};
use tracing::debug;

use crate::resolver::{ResolvedSession, SessionResolver};

/// The incoming call a `Start(AnswerCall)` action is answering.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnswerTarget {
    pub user_id: UserId,
    pub conversation_id: ConversationId,
}

struct Source {
    name: &'static str,
    stream: Option<LiveStream<Vec<NotificationData>>>,
    latest: Option<Vec<NotificationData>>,
}

/// Combine-latest over an ordered set of call-list sources.
///
/// Emits once every source has produced a list, then on every change. A
/// completed source keeps contributing its last list. The stream ends when
/// every source has completed, or when a source completes without ever
/// producing a list.
pub struct CombinedCalls {
    sources: Vec<Source>,
}

impl CombinedCalls {
    pub fn new(sources: Vec<(&'static str, LiveStream<Vec<NotificationData>>)>) -> Self {
        Self {
            sources: sources
                .into_iter()
                .map(|(name, stream)| Source {
                    name,
                    stream: Some(stream),
                    latest: None,
                })
                .collect(),
        }
    }

    fn merged(&self) -> Vec<NotificationData> {
        self.sources
            .iter()
            .filter_map(|source| source.latest.as_ref())
            .flatten()
            .cloned()
            .collect()
    }
}

impl Stream for CombinedCalls {
    type Item = Result<Vec<NotificationData>, CallError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let mut changed = false;

        for source in &mut this.sources {
            while let Some(stream) = source.stream.as_mut() {
                match stream.as_mut().poll_next(cx) {
                    Poll::Ready(Some(Ok(list))) => {
                        source.latest = Some(list);
                        changed = true;
                    }
                    Poll::Ready(Some(Err(error))) => return Poll::Ready(Some(Err(error))),
                    Poll::Ready(None) => {
                        debug!(source = source.name, "call source completed");
                        source.stream = None;
                    }
                    Poll::Pending => break,
                }
            }
            if source.stream.is_none() && source.latest.is_none() {
                return Poll::Ready(None);
            }
        }

        let ready = this.sources.iter().all(|source| source.latest.is_some());
        if changed && ready {
            return Poll::Ready(Some(Ok(this.merged())));
        }
        if this.sources.iter().all(|source| source.stream.is_none()) {
            return Poll::Ready(None);
        }
        Poll::Pending
    }
}

/// The decision for one combined call list: show the first call, or stop.
pub fn decide(calls: &[NotificationData]) -> Decision {
    match calls.first() {
        Some(first) => Decision::Update(first.clone()),
        None => Decision::Stop(StopReason::NoCalls),
    }
}

#[derive(Clone)]
pub struct CallStateAggregator {
    resolver: SessionResolver,
}

impl CallStateAggregator {
    pub fn new(resolver: SessionResolver) -> Self {
        Self { resolver }
    }

    /// Live combined calls of `session`, with the answer target's incoming
    /// call appended when one is given.
    pub async fn combined(
        &self,
        session: &ResolvedSession,
        target: Option<&AnswerTarget>,
    ) -> Result<CombinedCalls, CallError> {
        let established = notify_as(session, session.scope.established_calls());
        let outgoing = notify_as(session, session.scope.outgoing_calls());
        let answering = match target {
            Some(target) => self.answering(target).await?,
            None => empty_source(),
        };
        Ok(CombinedCalls::new(vec![
            ("established", established),
            ("outgoing", outgoing),
            ("answering", answering),
        ]))
    }

    async fn answering(&self, target: &AnswerTarget) -> Result<LiveStream<Vec<NotificationData>>, CallError> {
        let Some(owner) = self.resolver.resolve_user(&target.user_id).await? else {
            debug!(user_id = %target.user_id, "answer target has no valid session");
            return Ok(empty_source());
        };
        let conversation_id = target.conversation_id.clone();
        let incoming = owner.scope.incoming_calls().map(move |result| {
            result.map(|calls| {
                calls
                    .into_iter()
                    .filter(|call| call.conversation_id == conversation_id)
                    .collect::<Vec<Call>>()
            })
        });
        Ok(notify_as(&owner, Box::pin(incoming)))
    }
}

fn notify_as(session: &ResolvedSession, calls: LiveStream<Vec<Call>>) -> LiveStream<Vec<NotificationData>> {
    let user_id = session.user_id.clone();
    let display_name = session.display_name.clone();
    Box::pin(calls.map(move |result| {
        result.map(|calls| {
            calls
                .into_iter()
                .map(|call| NotificationData::new(user_id.clone(), call, display_name.clone()))
                .collect()
        })
    }))
}

fn empty_source() -> LiveStream<Vec<NotificationData>> {
    Box::pin(stream::once(async { Ok(Vec::new()) }))
}
