//! DNS port remap
//!
//! Installs the nat-PREROUTING redirect that captures clients' port-53 UDP
//! traffic and diverts it to the proxy's listen port. The redirect lives in
//! its own chain (`<chain_prefix>DNSOR`) whose jump is inserted at position
//! 1 of PREROUTING so it wins against pre-existing NAT rules.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use super::driver::NetfilterDriver;
use crate::error::NetfilterError;

/// Port-remap controller
pub struct PortRemap {
    driver: Arc<dyn NetfilterDriver>,
    chain: String,
    from: u16,
    to: u16,
    enabled: AtomicBool,
}

impl PortRemap {
    pub fn new(driver: Arc<dyn NetfilterDriver>, chain: String, from: u16, to: u16) -> Self {
        Self {
            driver,
            chain,
            from,
            to,
            enabled: AtomicBool::new(false),
        }
    }

    /// Whether the remap is currently installed
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// (Re-)install the nat rules when `table` covers them
    ///
    /// Used both at enable time (`"all"`) and after an external flush
    /// notification names the nat table.
    pub async fn install_for_table(&self, table: &str) -> Result<(), NetfilterError> {
        if table != "all" && table != "nat" {
            return Ok(());
        }

        self.driver.clear_chain("nat", &self.chain).await?;
        self.driver
            .append_unique(
                "nat",
                &self.chain,
                &[
                    "-p".into(),
                    "udp".into(),
                    "--dport".into(),
                    self.from.to_string(),
                    "-j".into(),
                    "REDIRECT".into(),
                    "--to-port".into(),
                    self.to.to_string(),
                ],
            )
            .await?;
        self.driver
            .insert_unique("nat", "PREROUTING", 1, &self.jump_spec())
            .await?;

        debug!(chain = %self.chain, from = self.from, to = self.to, "port remap installed");
        Ok(())
    }

    /// Enable the remap; already enabled is a no-op
    pub async fn enable(&self) -> Result<(), NetfilterError> {
        if self.is_enabled() {
            return Ok(());
        }
        if let Err(e) = self.install_for_table("all").await {
            let _ = self.disable().await;
            return Err(e);
        }
        self.enabled.store(true, Ordering::SeqCst);
        info!(chain = %self.chain, "DNS port remap enabled");
        Ok(())
    }

    /// Remove the remap, accumulating errors instead of short-circuiting
    pub async fn disable(&self) -> Vec<NetfilterError> {
        let mut errors = Vec::new();

        if let Err(e) = self
            .driver
            .delete_if_exists("nat", "PREROUTING", &self.jump_spec())
            .await
        {
            errors.push(e);
        }
        if let Err(e) = self.driver.clear_and_delete_chain("nat", &self.chain).await {
            errors.push(e);
        }

        self.enabled.store(false, Ordering::SeqCst);
        errors
    }

    fn jump_spec(&self) -> Vec<String> {
        vec!["-j".into(), self.chain.clone()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nf::MemoryDriver;

    fn remap(driver: &Arc<MemoryDriver>) -> PortRemap {
        PortRemap::new(
            Arc::clone(driver) as Arc<dyn NetfilterDriver>,
            "RTMK_DNSOR".into(),
            53,
            7548,
        )
    }

    #[tokio::test]
    async fn test_enable_installs_redirect() {
        let driver = Arc::new(MemoryDriver::new());
        let remap = remap(&driver);

        remap.enable().await.unwrap();
        assert!(remap.is_enabled());

        let rules = driver.chain_rules("nat", "RTMK_DNSOR").unwrap();
        assert_eq!(rules.len(), 1);
        assert!(rules[0].contains(&"REDIRECT".to_string()));
        assert!(rules[0].contains(&"7548".to_string()));

        let prerouting = driver.chain_rules("nat", "PREROUTING").unwrap();
        assert_eq!(prerouting[0], vec!["-j".to_string(), "RTMK_DNSOR".to_string()]);
    }

    #[tokio::test]
    async fn test_enable_twice_is_noop() {
        let driver = Arc::new(MemoryDriver::new());
        let remap = remap(&driver);
        remap.enable().await.unwrap();
        remap.enable().await.unwrap();
        assert_eq!(driver.chain_rules("nat", "RTMK_DNSOR").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_disable_removes_everything() {
        let driver = Arc::new(MemoryDriver::new());
        let remap = remap(&driver);
        remap.enable().await.unwrap();

        let errors = remap.disable().await;
        assert!(errors.is_empty());
        assert!(!remap.is_enabled());
        assert!(driver.chain_rules("nat", "RTMK_DNSOR").is_none());
        assert!(driver
            .chain_rules("nat", "PREROUTING")
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_reinstall_after_flush() {
        let driver = Arc::new(MemoryDriver::new());
        let remap = remap(&driver);
        remap.enable().await.unwrap();

        driver.flush_table("nat");
        assert!(driver.chain_rules("nat", "RTMK_DNSOR").is_none());

        remap.install_for_table("nat").await.unwrap();
        assert_eq!(driver.chain_rules("nat", "RTMK_DNSOR").unwrap().len(), 1);

        // a mangle-only notification must not touch nat
        driver.flush_table("nat");
        remap.install_for_table("mangle").await.unwrap();
        assert!(driver.chain_rules("nat", "RTMK_DNSOR").is_none());
    }
}
