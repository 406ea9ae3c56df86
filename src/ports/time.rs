use core::time::Duration;

/// Wall clock in Unix seconds. Queue timestamps (`runat`, `updateat`,
/// `runorder`) all come from here so tests can drive time by hand.
#[async_trait::async_trait]
pub trait TimePort: Send + Sync {
    fn now_secs(&self) -> i64;
    async fn sleep(&self, duration: Duration);
}
