use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::{
    domain::ChatId,
    messaging::{
        port::MessagingPort,
        types::{MessagingCapabilities, TextFormat},
    },
    Result,
};

/// How often idle per-chat limiters are dropped.
const CHAT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug)]
pub struct ThrottleConfig {
    /// Minimum spacing between *any* outbound calls (global flood control).
    pub global_min_interval: Duration,
    /// Minimum spacing between calls to the same chat.
    pub per_chat_min_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            global_min_interval: Duration::from_millis(40), // ~25/sec
            per_chat_min_interval: Duration::from_millis(1050), // ~0.95/sec
        }
    }
}

#[derive(Debug)]
struct IntervalLimiter {
    interval: Duration,
    next: Instant,
}

impl IntervalLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Instant::now(),
        }
    }

    /// Reserve the next slot and return the wait required before executing.
    fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let start = if now >= self.next { now } else { self.next };
        self.next = start + self.interval;
        start.saturating_duration_since(now)
    }
}

/// Per-chat limiters, swept of idle entries as they are looked up.
struct ChatLimiters {
    map: HashMap<i64, Arc<Mutex<IntervalLimiter>>>,
    last_sweep: Instant,
}

impl ChatLimiters {
    /// Drop limiters whose next slot has already passed and that no caller holds.
    fn sweep(&mut self, now: Instant) {
        self.last_sweep = now;
        self.map.retain(|_, lim| {
            Arc::strong_count(lim) > 1
                || lim.try_lock().map_or(true, |guard| guard.next > now)
        });
    }
}

/// MessagingPort decorator that spaces out outbound calls.
///
/// Reduces Telegram 429s when one chat gets a progress notice and a reply in
/// quick succession; it does not guarantee zero 429s.
pub struct ThrottledMessenger {
    inner: Arc<dyn MessagingPort>,
    cfg: ThrottleConfig,
    global: Mutex<IntervalLimiter>,
    per_chat: Mutex<ChatLimiters>,
}

impl ThrottledMessenger {
    pub fn new(inner: Arc<dyn MessagingPort>, cfg: ThrottleConfig) -> Self {
        Self {
            inner,
            cfg,
            global: Mutex::new(IntervalLimiter::new(cfg.global_min_interval)),
            per_chat: Mutex::new(ChatLimiters {
                map: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    async fn limiter_for_chat(&self, chat_id: i64) -> Arc<Mutex<IntervalLimiter>> {
        let mut chats = self.per_chat.lock().await;
        let now = Instant::now();
        if now.saturating_duration_since(chats.last_sweep) >= CHAT_SWEEP_INTERVAL {
            chats.sweep(now);
        }
        chats
            .map
            .entry(chat_id)
            .or_insert_with(|| {
                Arc::new(Mutex::new(IntervalLimiter::new(
                    self.cfg.per_chat_min_interval,
                )))
            })
            .clone()
    }

    async fn throttle_chat(&self, chat_id: i64) {
        let global_wait = { self.global.lock().await.reserve() };
        let chat_wait = {
            let lim = self.limiter_for_chat(chat_id).await;
            let mut guard = lim.lock().await;
            guard.reserve()
        };

        let wait = global_wait.max(chat_wait);
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }

    async fn throttle_global(&self) {
        let wait = { self.global.lock().await.reserve() };
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }
}

#[async_trait::async_trait]
impl MessagingPort for ThrottledMessenger {
    fn capabilities(&self) -> MessagingCapabilities {
        self.inner.capabilities()
    }

    async fn send_text(&self, chat_id: ChatId, text: &str, format: TextFormat) -> Result<()> {
        self.throttle_chat(chat_id.0).await;
        self.inner.send_text(chat_id, text, format).await
    }

    async fn answer_callback_query(&self, callback_id: &str, text: Option<&str>) -> Result<()> {
        // No chat_id available here; apply global throttling only.
        self.throttle_global().await;
        self.inner.answer_callback_query(callback_id, text).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder {
        sent: StdMutex<Vec<(i64, Instant)>>,
    }

    #[async_trait::async_trait]
    impl MessagingPort for Recorder {
        fn capabilities(&self) -> MessagingCapabilities {
            MessagingCapabilities {
                supports_markdown: true,
                supports_callbacks: true,
            }
        }

        async fn send_text(&self, chat_id: ChatId, _text: &str, _f: TextFormat) -> Result<()> {
            self.sent.lock().unwrap().push((chat_id.0, Instant::now()));
            Ok(())
        }

        async fn answer_callback_query(&self, _id: &str, _text: Option<&str>) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn spaces_messages_to_the_same_chat() {
        let inner = Arc::new(Recorder::default());
        let throttled = ThrottledMessenger::new(inner.clone(), ThrottleConfig::default());

        throttled
            .send_text(ChatId(1), "a", TextFormat::Plain)
            .await
            .unwrap();
        throttled
            .send_text(ChatId(1), "b", TextFormat::Plain)
            .await
            .unwrap();

        let sent = inner.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
        assert!(sent[1].1 - sent[0].1 >= Duration::from_millis(1050));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_chat_limiters_are_dropped() {
        let inner = Arc::new(Recorder::default());
        let throttled = ThrottledMessenger::new(inner.clone(), ThrottleConfig::default());

        for chat in 0..500 {
            throttled
                .send_text(ChatId(chat), "hi", TextFormat::Plain)
                .await
                .unwrap();
        }
        assert_eq!(throttled.per_chat.lock().await.map.len(), 500);

        tokio::time::advance(Duration::from_secs(7 * 24 * 3600)).await;
        throttled
            .send_text(ChatId(9_999), "hi", TextFormat::Plain)
            .await
            .unwrap();

        let chats = throttled.per_chat.lock().await;
        assert_eq!(chats.map.len(), 1);
        assert!(chats.map.contains_key(&9_999));
    }
}
