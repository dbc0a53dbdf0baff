//! 按线程的事件广播：append_event 成功后推送给订阅者
//!
//! 订阅者落后（Lagged）或重连时，应通过 events_for_thread(after_seq) 重新拉取补齐。
//! 调用方须按 seq 顺序调用 publish（存储层在分配 seq 的临界区内推送）。

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;

use super::types::Event;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Default)]
pub struct EventBus {
    channels: Mutex<HashMap<String, broadcast::Sender<Event>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, thread_id: &str) -> broadcast::Receiver<Event> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(thread_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// 推送事件；最后一个订阅者离开后通道随之释放
    pub fn publish(&self, event: &Event) {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = channels.get(&event.thread_id) else {
            return;
        };
        if tx.receiver_count() == 0 {
            channels.remove(&event.thread_id);
            return;
        }
        let _ = tx.send(event.clone());
    }

    /// 仍持有通道的线程数
    pub fn channel_count(&self) -> usize {
        self.channels.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// 线程删除后释放其通道
    pub fn close(&self, thread_id: &str) {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels.remove(thread_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EventType;

    fn event(thread_id: &str, seq: u64) -> Event {
        let mut event = Event::new(EventType::Response, format!("event {seq}"));
        event.thread_id = thread_id.to_string();
        event.seq = seq;
        event
    }

    #[tokio::test]
    async fn test_channel_dropped_after_last_subscriber_leaves() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("t1");
        bus.publish(&event("t1", 1));
        assert_eq!(rx.recv().await.unwrap().seq, 1);
        assert_eq!(bus.channel_count(), 1);

        drop(rx);
        bus.publish(&event("t1", 2));
        assert_eq!(bus.channel_count(), 0);

        // 重新订阅得到新通道
        let mut rx = bus.subscribe("t1");
        bus.publish(&event("t1", 3));
        assert_eq!(rx.recv().await.unwrap().seq, 3);
    }
}
