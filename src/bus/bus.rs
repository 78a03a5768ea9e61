//! 感知总线：每个订阅者一个有界 tokio 通道，显式背压策略
//!
//! - drop_oldest：每个订阅者一个 broadcast 通道，满时覆盖最旧事件，接收端以 Lagged 计入丢弃数
//! - block_with_timeout：每个订阅者一个 mpsc 通道，发布方最多等待 block_timeout，超时丢弃新事件
//!
//! broadcast 容量向上取整到 2 的幂。每个订阅者至多收到一次；只保留有限的最近事件历史。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::bus::{EventFilter, EventKind, PerceptionEvent};
use crate::config::BusSection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    #[default]
    DropOldest,
    BlockWithTimeout,
}

#[derive(Clone)]
enum Outlet {
    Latest(broadcast::Sender<PerceptionEvent>),
    Bounded(mpsc::Sender<PerceptionEvent>),
}

enum Inlet {
    Latest(broadcast::Receiver<PerceptionEvent>),
    Bounded(mpsc::Receiver<PerceptionEvent>),
}

struct SubscriberEntry {
    id: u64,
    name: String,
    filter: EventFilter,
    outlet: Outlet,
}

struct BusInner {
    subscribers: Mutex<Vec<SubscriberEntry>>,
    policy: BackpressurePolicy,
    capacity: usize,
    block_timeout: Duration,
    history: Mutex<VecDeque<PerceptionEvent>>,
    history_size: usize,
    /// 所有订阅者因背压丢失的事件总数
    dropped: AtomicU64,
    next_id: AtomicU64,
}

impl BusInner {
    fn remove(&self, id: u64) {
        let mut subs = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pos) = subs.iter().position(|s| s.id == id) {
            let entry = subs.remove(pos);
            tracing::debug!(subscriber = %entry.name, "unsubscribed from perception bus");
        }
    }

    fn add_dropped(&self, n: u64) {
        self.dropped.fetch_add(n, Ordering::Relaxed);
    }
}

#[derive(Clone)]
pub struct PerceptionBus {
    inner: Arc<BusInner>,
}

impl PerceptionBus {
    pub fn new(
        capacity: usize,
        policy: BackpressurePolicy,
        block_timeout: Duration,
        history_size: usize,
    ) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(Vec::new()),
                policy,
                capacity: capacity.max(1),
                block_timeout,
                history: Mutex::new(VecDeque::new()),
                history_size,
                dropped: AtomicU64::new(0),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn from_config(cfg: &BusSection) -> Self {
        Self::new(
            cfg.subscriber_capacity,
            cfg.policy,
            cfg.block_timeout(),
            cfg.history_size,
        )
    }

    pub fn subscribe(&self, name: &str, filter: EventFilter) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (outlet, inlet) = match self.inner.policy {
            BackpressurePolicy::DropOldest => {
                let (tx, rx) = broadcast::channel(self.inner.capacity);
                (Outlet::Latest(tx), Inlet::Latest(rx))
            }
            BackpressurePolicy::BlockWithTimeout => {
                let (tx, rx) = mpsc::channel(self.inner.capacity);
                (Outlet::Bounded(tx), Inlet::Bounded(rx))
            }
        };
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(SubscriberEntry {
                id,
                name: name.to_string(),
                filter,
                outlet,
            });
        tracing::debug!(subscriber = name, "subscribed to perception bus");
        Subscription {
            id,
            inlet,
            dropped: 0,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// 注册回调监听者：后台任务逐个处理事件，直到总线关闭
    pub fn spawn_listener<F>(&self, name: &str, filter: EventFilter, mut callback: F) -> JoinHandle<()>
    where
        F: FnMut(PerceptionEvent) + Send + 'static,
    {
        let mut sub = self.subscribe(name, filter);
        tokio::spawn(async move {
            while let Some(event) = sub.recv().await {
                callback(event);
            }
        })
    }

    /// 发布事件，返回成功投递的订阅者数
    pub async fn publish(&self, event: PerceptionEvent) -> usize {
        {
            let mut history = self.inner.history.lock().unwrap_or_else(PoisonError::into_inner);
            if self.inner.history_size > 0 {
                if history.len() >= self.inner.history_size {
                    history.pop_front();
                }
                history.push_back(event.clone());
            }
        }

        let targets: Vec<Outlet> = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.filter.matches(&event))
            .map(|s| s.outlet.clone())
            .collect();

        let mut delivered = 0usize;
        for outlet in targets {
            match outlet {
                // 满时由通道覆盖最旧事件，丢弃数在接收端统计
                Outlet::Latest(tx) => {
                    if tx.send(event.clone()).is_ok() {
                        delivered += 1;
                    }
                }
                Outlet::Bounded(tx) => match tx.send_timeout(event.clone(), self.inner.block_timeout).await {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                        self.inner.add_dropped(1);
                        tracing::warn!(kind = event.kind.as_str(), "subscriber mailbox full, event dropped");
                    }
                    Err(mpsc::error::SendTimeoutError::Closed(_)) => {}
                },
            }
        }
        delivered
    }

    /// 某类事件的最近 limit 条历史（时间正序）
    pub fn history_of(&self, kind: EventKind, limit: usize) -> Vec<PerceptionEvent> {
        let history = self.inner.history.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<PerceptionEvent> = history
            .iter()
            .rev()
            .filter(|e| e.kind == kind)
            .take(limit)
            .cloned()
            .collect();
        out.reverse();
        out
    }

    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// 关闭所有订阅：发送端全部释放，接收端读完剩余事件后结束
    pub fn close(&self) {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Default for PerceptionBus {
    fn default() -> Self {
        Self::from_config(&BusSection::default())
    }
}

/// 订阅句柄；drop 时自动退订
pub struct Subscription {
    id: u64,
    inlet: Inlet,
    dropped: u64,
    bus: Weak<BusInner>,
}

impl Subscription {
    /// 等待下一个事件；总线关闭且通道读空时返回 None
    pub async fn recv(&mut self) -> Option<PerceptionEvent> {
        loop {
            let lagged = match &mut self.inlet {
                Inlet::Bounded(rx) => return rx.recv().await,
                Inlet::Latest(rx) => match rx.recv().await {
                    Ok(event) => return Some(event),
                    Err(broadcast::error::RecvError::Closed) => return None,
                    Err(broadcast::error::RecvError::Lagged(n)) => n,
                },
            };
            self.note_lag(lagged);
        }
    }

    pub fn try_recv(&mut self) -> Option<PerceptionEvent> {
        loop {
            let lagged = match &mut self.inlet {
                Inlet::Bounded(rx) => return rx.try_recv().ok(),
                Inlet::Latest(rx) => match rx.try_recv() {
                    Ok(event) => return Some(event),
                    Err(broadcast::error::TryRecvError::Lagged(n)) => n,
                    Err(_) => return None,
                },
            };
            self.note_lag(lagged);
        }
    }

    fn note_lag(&mut self, n: u64) {
        self.dropped += n;
        if let Some(bus) = self.bus.upgrade() {
            bus.add_dropped(n);
        }
    }

    /// 本订阅因背压丢失的事件数（drop_oldest 下在读取时统计）
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(kind: EventKind, n: u64) -> PerceptionEvent {
        PerceptionEvent::new(kind, "test", json!({ "n": n }))
    }

    #[tokio::test]
    async fn test_publish_reaches_matching_subscribers_once() {
        let bus = PerceptionBus::new(8, BackpressurePolicy::DropOldest, Duration::from_millis(10), 10);
        let mut all = bus.subscribe("all", EventFilter::all());
        let mut tools = bus.subscribe("tools", EventFilter::kinds([EventKind::ToolExecuted]));

        assert_eq!(bus.publish(event(EventKind::UserInput, 1)).await, 1);
        assert_eq!(bus.publish(event(EventKind::ToolExecuted, 2)).await, 2);

        assert_eq!(all.recv().await.unwrap().kind, EventKind::UserInput);
        assert_eq!(all.recv().await.unwrap().kind, EventKind::ToolExecuted);
        assert_eq!(tools.recv().await.unwrap().payload["n"], 2);
        assert!(tools.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_drop_oldest_keeps_newest() {
        let bus = PerceptionBus::new(2, BackpressurePolicy::DropOldest, Duration::from_millis(10), 10);
        let mut sub = bus.subscribe("slow", EventFilter::all());
        for n in 0..5 {
            bus.publish(event(EventKind::UserInput, n)).await;
        }
        assert_eq!(sub.try_recv().unwrap().payload["n"], 3);
        assert_eq!(sub.try_recv().unwrap().payload["n"], 4);
        assert_eq!(sub.dropped(), 3);
        assert_eq!(bus.dropped(), 3);
    }

    #[tokio::test]
    async fn test_block_with_timeout_drops_new_event() {
        let bus = PerceptionBus::new(1, BackpressurePolicy::BlockWithTimeout, Duration::from_millis(20), 10);
        let mut sub = bus.subscribe("slow", EventFilter::all());
        assert_eq!(bus.publish(event(EventKind::UserInput, 1)).await, 1);
        let started = std::time::Instant::now();
        assert_eq!(bus.publish(event(EventKind::UserInput, 2)).await, 0);
        assert!(started.elapsed() >= Duration::from_millis(15));
        assert_eq!(sub.try_recv().unwrap().payload["n"], 1);
        assert!(sub.try_recv().is_none());
        assert_eq!(bus.dropped(), 1);
    }

    #[tokio::test]
    async fn test_block_with_timeout_resumes_when_space_frees() {
        let bus = PerceptionBus::new(1, BackpressurePolicy::BlockWithTimeout, Duration::from_secs(2), 10);
        let mut sub = bus.subscribe("consumer", EventFilter::all());
        bus.publish(event(EventKind::UserInput, 1)).await;
        let publisher = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.publish(event(EventKind::UserInput, 2)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(sub.recv().await.unwrap().payload["n"], 1);
        assert_eq!(publisher.await.unwrap(), 1);
        assert_eq!(sub.recv().await.unwrap().payload["n"], 2);
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let bus = PerceptionBus::default();
        let sub = bus.subscribe("temp", EventFilter::all());
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.publish(event(EventKind::UserInput, 1)).await, 0);
    }

    #[tokio::test]
    async fn test_listener_callback_and_close() {
        let bus = PerceptionBus::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handle = {
            let seen = seen.clone();
            bus.spawn_listener("collector", EventFilter::all(), move |ev| {
                seen.lock().unwrap().push(ev.kind);
            })
        };
        bus.publish(event(EventKind::PlanProduced, 1)).await;
        bus.publish(event(EventKind::InteractionCompleted, 2)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.close();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![EventKind::PlanProduced, EventKind::InteractionCompleted]
        );
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let bus = PerceptionBus::new(4, BackpressurePolicy::DropOldest, Duration::from_millis(10), 3);
        for n in 0..5 {
            bus.publish(event(EventKind::ToolExecuted, n)).await;
        }
        bus.publish(event(EventKind::ErrorRaised, 9)).await;
        let tools = bus.history_of(EventKind::ToolExecuted, 10);
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[1].payload["n"], 4);
        assert_eq!(bus.history_of(EventKind::ErrorRaised, 5).len(), 1);
        assert_eq!(bus.dropped(), 0);
    }
}
