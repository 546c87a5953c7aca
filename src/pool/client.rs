//! Single WebSocket client owning one trader batch.
//!
//! The connection, all control frames, and the receive loop live on one
//! task; outside callers talk to it through a command channel. The logical
//! batch is kept separately from the socket so a reconnect always restores
//! the last intended subscription set.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use super::wire::{ping_frame, ControlRequest, Envelope};
use crate::config::{ExchangeConfig, PoolConfig};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug)]
pub enum ClientCommand {
    Subscribe(String),
    Unsubscribe(String),
    Stop,
}

/// Exponential reconnect delay: `min(base * 2^(attempt-1), max)`
pub fn reconnect_delay(base_secs: f64, max_secs: f64, attempt: u32) -> f64 {
    let exp = 2f64.powi(attempt.saturating_sub(1).min(30) as i32);
    (base_secs * exp).min(max_secs)
}

fn jittered(delay_secs: f64) -> Duration {
    // Up to +-10% to avoid herding reconnects
    let factor = 1.0 + rand::thread_rng().gen_range(-0.1..0.1);
    Duration::from_secs_f64((delay_secs * factor).max(0.0))
}

pub struct TraderWsClient {
    pub client_id: usize,
    exchange: ExchangeConfig,
    pool: PoolConfig,
    traders: Arc<RwLock<Vec<String>>>,
    connected: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    cmd_tx: mpsc::UnboundedSender<ClientCommand>,
    cmd_rx: Mutex<Option<mpsc::UnboundedReceiver<ClientCommand>>>,
    frame_tx: mpsc::UnboundedSender<Envelope>,
    disconnect_tx: mpsc::UnboundedSender<usize>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TraderWsClient {
    pub fn new(
        client_id: usize,
        traders: Vec<String>,
        exchange: ExchangeConfig,
        pool: PoolConfig,
        frame_tx: mpsc::UnboundedSender<Envelope>,
        disconnect_tx: mpsc::UnboundedSender<usize>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        Self {
            client_id,
            exchange,
            pool,
            traders: Arc::new(RwLock::new(traders)),
            connected: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            cmd_tx,
            cmd_rx: Mutex::new(Some(cmd_rx)),
            frame_tx,
            disconnect_tx,
            task: Mutex::new(None),
        }
    }

    /// Connect, subscribe the assigned batch, and spawn the receive loop.
    /// Returns true once subscribed. A failed initial connect still spawns
    /// the loop so the normal backoff recovery takes over.
    pub async fn start(&self) -> bool {
        let Some(cmd_rx) = self.cmd_rx.lock().take() else {
            warn!(client_id = self.client_id, "client already started");
            return self.is_connected();
        };
        self.running.store(true, Ordering::Release);

        let initial = connect_and_subscribe(
            self.client_id,
            &self.exchange,
            &self.pool,
            &self.traders,
        )
        .await;

        let ok = initial.is_ok();
        let stream = match initial {
            Ok(stream) => {
                self.connected.store(true, Ordering::Release);
                Some(stream)
            }
            Err(e) => {
                error!(client_id = self.client_id, error = %e, "client start failed");
                None
            }
        };

        let task = tokio::spawn(run_client(
            self.client_id,
            self.exchange.clone(),
            self.pool.clone(),
            Arc::clone(&self.traders),
            Arc::clone(&self.connected),
            Arc::clone(&self.running),
            cmd_rx,
            self.frame_tx.clone(),
            self.disconnect_tx.clone(),
            stream,
        ));
        *self.task.lock() = Some(task);

        ok
    }

    /// Idempotent: signals the owning task to close the socket and exit.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let _ = self.cmd_tx.send(ClientCommand::Stop);
    }

    /// Add an address to the logical batch; the control frame goes out only
    /// while connected, and a reconnect re-subscribes the whole batch.
    pub fn subscribe(&self, address: &str) {
        {
            let mut traders = self.traders.write();
            if !traders.iter().any(|a| a == address) {
                traders.push(address.to_string());
            }
        }
        let _ = self.cmd_tx.send(ClientCommand::Subscribe(address.to_string()));
    }

    pub fn unsubscribe(&self, address: &str) {
        self.traders.write().retain(|a| a != address);
        let _ = self
            .cmd_tx
            .send(ClientCommand::Unsubscribe(address.to_string()));
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn traders(&self) -> Vec<String> {
        self.traders.read().clone()
    }

    pub fn trader_count(&self) -> usize {
        self.traders.read().len()
    }
}

async fn connect_and_subscribe(
    client_id: usize,
    exchange: &ExchangeConfig,
    pool: &PoolConfig,
    traders: &Arc<RwLock<Vec<String>>>,
) -> Result<WsStream> {
    let (mut stream, response) = connect_async(exchange.ws_url.as_str())
        .await
        .context("websocket connect failed")?;
    debug!(client_id, status = %response.status(), "client connected");

    let batch: Vec<String> = traders.read().clone();
    for address in &batch {
        let frame = serde_json::to_string(&ControlRequest::subscribe_user(address))
            .context("serialize subscribe frame")?;
        stream
            .send(Message::Text(frame))
            .await
            .context("send subscribe frame")?;
        sleep(Duration::from_millis(pool.subscribe_pacing_ms)).await;
    }

    info!(client_id, traders = batch.len(), "client subscribed");
    Ok(stream)
}

/// Wait out a backoff delay while staying responsive to Stop.
/// Returns true when the client should shut down.
async fn backoff_or_stop(
    cmd_rx: &mut mpsc::UnboundedReceiver<ClientCommand>,
    delay: Duration,
) -> bool {
    let timer = sleep(delay);
    tokio::pin!(timer);
    loop {
        tokio::select! {
            _ = &mut timer => return false,
            cmd = cmd_rx.recv() => match cmd {
                None | Some(ClientCommand::Stop) => return true,
                // Batch already updated by the caller; reconnect will
                // re-subscribe everything.
                Some(_) => continue,
            },
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_client(
    client_id: usize,
    exchange: ExchangeConfig,
    pool: PoolConfig,
    traders: Arc<RwLock<Vec<String>>>,
    connected: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    mut cmd_rx: mpsc::UnboundedReceiver<ClientCommand>,
    frame_tx: mpsc::UnboundedSender<Envelope>,
    disconnect_tx: mpsc::UnboundedSender<usize>,
    initial_stream: Option<WsStream>,
) {
    let mut stream_slot = initial_stream;
    let mut attempts: u32 = 0;

    loop {
        let mut stream = match stream_slot.take() {
            Some(stream) => stream,
            None => {
                if !running.load(Ordering::Acquire) {
                    return;
                }
                attempts += 1;
                if attempts > pool.max_reconnect_attempts {
                    error!(client_id, attempts, "max reconnect attempts exceeded");
                    connected.store(false, Ordering::Release);
                    let _ = disconnect_tx.send(client_id);
                    return;
                }

                let delay = reconnect_delay(
                    pool.reconnect_base_delay_secs,
                    pool.reconnect_max_delay_secs,
                    attempts,
                );
                info!(client_id, attempt = attempts, delay_secs = delay, "reconnecting");
                if backoff_or_stop(&mut cmd_rx, jittered(delay)).await {
                    connected.store(false, Ordering::Release);
                    return;
                }

                match connect_and_subscribe(client_id, &exchange, &pool, &traders).await {
                    Ok(stream) => {
                        attempts = 0;
                        connected.store(true, Ordering::Release);
                        stream
                    }
                    Err(e) => {
                        warn!(client_id, error = %e, "reconnect attempt failed");
                        continue;
                    }
                }
            }
        };

        let mut heartbeat =
            tokio::time::interval(Duration::from_secs(exchange.heartbeat_interval_secs.max(1)));
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // Receive loop; breaking out of it re-enters the reconnect path.
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    None | Some(ClientCommand::Stop) => {
                        let _ = stream.close(None).await;
                        connected.store(false, Ordering::Release);
                        info!(client_id, "client stopped");
                        return;
                    }
                    Some(ClientCommand::Subscribe(address)) => {
                        if let Ok(frame) = serde_json::to_string(&ControlRequest::subscribe_user(&address)) {
                            if let Err(e) = stream.send(Message::Text(frame)).await {
                                warn!(client_id, error = %e, "subscribe frame failed");
                                connected.store(false, Ordering::Release);
                                break;
                            }
                        }
                    }
                    Some(ClientCommand::Unsubscribe(address)) => {
                        if let Ok(frame) = serde_json::to_string(&ControlRequest::unsubscribe_user(&address)) {
                            if let Err(e) = stream.send(Message::Text(frame)).await {
                                warn!(client_id, error = %e, "unsubscribe frame failed");
                                connected.store(false, Ordering::Release);
                                break;
                            }
                        }
                    }
                },
                _ = heartbeat.tick() => {
                    if let Err(e) = stream.send(Message::Text(ping_frame().to_string())).await {
                        warn!(client_id, error = %e, "heartbeat send failed");
                        connected.store(false, Ordering::Release);
                        break;
                    }
                },
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        match Envelope::parse(&text) {
                            Ok(envelope) => {
                                if frame_tx.send(envelope).is_err() {
                                    // Router gone; nothing left to feed.
                                    connected.store(false, Ordering::Release);
                                    return;
                                }
                            }
                            Err(e) => {
                                warn!(client_id, error = %e, "unparseable frame dropped");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(e) = stream.send(Message::Pong(payload)).await {
                            warn!(client_id, error = %e, "pong send failed");
                            connected.store(false, Ordering::Release);
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        warn!(client_id, ?frame, "connection closed by server");
                        connected.store(false, Ordering::Release);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!(client_id, error = %e, "websocket read error");
                        connected.store(false, Ordering::Release);
                        break;
                    }
                    None => {
                        warn!(client_id, "websocket stream ended");
                        connected.store(false, Ordering::Release);
                        break;
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_delay_formula() {
        assert_eq!(reconnect_delay(1.0, 60.0, 1), 1.0);
        assert_eq!(reconnect_delay(1.0, 60.0, 2), 2.0);
        assert_eq!(reconnect_delay(1.0, 60.0, 5), 16.0);
        // Capped at max
        assert_eq!(reconnect_delay(1.0, 60.0, 10), 60.0);
        assert_eq!(reconnect_delay(2.0, 30.0, 6), 30.0);
    }

    #[tokio::test]
    async fn test_logical_batch_mutation_while_disconnected() {
        let (frame_tx, _frame_rx) = mpsc::unbounded_channel();
        let (disconnect_tx, _disconnect_rx) = mpsc::unbounded_channel();
        let client = TraderWsClient::new(
            0,
            vec!["0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_string()],
            ExchangeConfig::default(),
            PoolConfig::default(),
            frame_tx,
            disconnect_tx,
        );

        // Never started; the logical batch must still track intent so a
        // later (re)connect subscribes the full set.
        client.subscribe("0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb");
        client.subscribe("0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb");
        assert_eq!(client.trader_count(), 2);

        client.unsubscribe("0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        assert_eq!(
            client.traders(),
            vec!["0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb".to_string()]
        );
        assert!(!client.is_connected());
    }
}
