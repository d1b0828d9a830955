// Copyright 2022 LEXUGE
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use crate::error::{Result, UpstreamError};
use async_trait::async_trait;
use bytes::Bytes;
use domain::base::Message;
use futures::future::join_all;
use log::debug;
use std::{sync::Weak, time::Duration};
use tokio::{
    sync::{mpsc, oneshot},
    time::sleep,
};

// One queued query with its reply slot.
pub(super) struct Pending {
    msg: Message<Bytes>,
    resp: oneshot::Sender<Result<Message<Bytes>>>,
}

/// What the batch worker needs from its owner: a client shared across one batch, and a
/// way to shape-and-exchange a single query with it.
#[async_trait]
pub(super) trait BatchExchanger: Send + Sync + 'static {
    /// The client handle shared by every query of one batch.
    type Client: Clone + Send + Sync + 'static;

    /// Get or create the client for the upcoming batch.
    async fn batch_client(&self) -> Result<Self::Client>;

    /// Shape and exchange one query over the shared client.
    async fn batch_exchange_one(
        &self,
        client: Self::Client,
        msg: Message<Bytes>,
    ) -> Result<Message<Bytes>>;
}

// A submission handle for the batch queue. Handles are cheap clones around the same
// channel; once the last one is dropped (or the owner is gone) the worker fails
// whatever is still queued and ends.
#[derive(Clone)]
pub(super) struct BatchQueue {
    tx: mpsc::Sender<Pending>,
}

impl BatchQueue {
    pub fn start<X>(
        exchanger: Weak<X>,
        window: Duration,
        batch_size: usize,
        queue_len: usize,
    ) -> Self
    where
        X: BatchExchanger,
    {
        let (tx, rx) = mpsc::channel(queue_len);
        tokio::spawn(worker(exchanger, rx, window, batch_size));
        Self { tx }
    }

    /// Queue one query. Blocks when the queue is full. The receiver resolves once the
    /// worker has exchanged the query.
    pub async fn submit(
        &self,
        msg: Message<Bytes>,
    ) -> Result<oneshot::Receiver<Result<Message<Bytes>>>> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.tx
            .send(Pending {
                msg,
                resp: resp_tx,
            })
            .await
            .map_err(|_| UpstreamError::Closed)?;
        Ok(resp_rx)
    }
}

async fn worker<X>(
    exchanger: Weak<X>,
    mut rx: mpsc::Receiver<Pending>,
    window: Duration,
    batch_size: usize,
) where
    X: BatchExchanger,
{
    while let Some(first) = rx.recv().await {
        // The first query opens a short window for others to pile in behind it.
        let mut batch = vec![first];
        let deadline = sleep(window);
        tokio::pin!(deadline);
        while batch.len() < batch_size {
            tokio::select! {
                _ = &mut deadline => break,
                more = rx.recv() => match more {
                    Some(pending) => batch.push(pending),
                    None => break,
                },
            }
        }

        let exchanger = match exchanger.upgrade() {
            Some(exchanger) => exchanger,
            None => {
                fail(batch, || UpstreamError::Closed);
                break;
            }
        };

        // One client serves the whole batch.
        let client = match exchanger.batch_client().await {
            Ok(client) => client,
            Err(UpstreamError::Closed) => {
                fail(batch, || UpstreamError::Closed);
                continue;
            }
            Err(e) => {
                debug!("batch client unavailable: {}", e);
                let reason = e.to_string();
                fail(batch, || UpstreamError::BatchClient(reason.clone()));
                continue;
            }
        };

        // Fire the whole batch concurrently and drain it before opening the next window.
        join_all(batch.into_iter().map(|pending| {
            let client = client.clone();
            let exchanger = exchanger.clone();
            async move {
                let outcome = exchanger.batch_exchange_one(client, pending.msg).await;
                let _ = pending.resp.send(outcome);
            }
        }))
        .await;
    }
    debug!("batch worker stopped");
}

fn fail(batch: Vec<Pending>, err: impl Fn() -> UpstreamError) {
    for pending in batch {
        let _ = pending.resp.send(Err(err()));
    }
}
