//! The command pipe: a full-duplex request/reply channel between the
//! Learning Core client and the Central Controller.
//!
//! Modeled as two unidirectional bounded `mpsc` channels wrapped so that
//! `call()` reads like a synchronous RPC — send the request, await the
//! matching reply — without ever blocking the runtime thread. Only one
//! request may be in flight per `CommandPipeClient` handle, which preserves
//! strict ordering between a caller and the controller.

use tokio::sync::{mpsc, oneshot};

use super::{RpcRequest, RpcResult};

/// One request in flight: the payload plus a one-shot channel the
/// controller replies on.
pub struct PipeRequest {
    pub request: RpcRequest,
    pub reply_to: oneshot::Sender<RpcResult>,
}

/// Held by the Central Controller; the receiving end of the pipe.
pub struct CommandPipeServer {
    pub inbox: mpsc::Receiver<PipeRequest>,
}

/// Held by the Learning Core; the calling end of the pipe.
#[derive(Clone)]
pub struct CommandPipeClient {
    outbox: mpsc::Sender<PipeRequest>,
}

pub fn channel(capacity: usize) -> (CommandPipeClient, CommandPipeServer) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        CommandPipeClient { outbox: tx },
        CommandPipeServer { inbox: rx },
    )
}

impl CommandPipeClient {
    /// Send `request` and await the controller's reply. Blocks (awaits)
    /// until the controller processes it; the controller's main loop only
    /// polls the pipe non-blockingly, so this may span several steps if
    /// the controller is busy or in watchdog regime.
    pub async fn call(&self, request: RpcRequest) -> anyhow::Result<RpcResult> {
        let (reply_to, reply_rx) = oneshot::channel();
        self.outbox
            .send(PipeRequest { request, reply_to })
            .await
            .map_err(|_| anyhow::anyhow!("command pipe closed: controller not running"))?;
        reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("command pipe closed before reply arrived"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{LaneOp, RpcRequest};

    #[tokio::test]
    async fn call_round_trips_through_server() {
        let (client, mut server) = channel(8);

        let server_task = tokio::spawn(async move {
            let req = server.inbox.recv().await.unwrap();
            assert!(matches!(
                req.request,
                RpcRequest::Lane(LaneOp::GetIdList)
            ));
            let _ = req.reply_to.send(Ok(serde_json::json!(["lane0", "lane1"])));
        });

        let result = client
            .call(RpcRequest::Lane(LaneOp::GetIdList))
            .await
            .unwrap();
        assert_eq!(result.unwrap(), serde_json::json!(["lane0", "lane1"]));
        server_task.await.unwrap();
    }
}
