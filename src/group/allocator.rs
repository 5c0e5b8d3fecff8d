//! Firewall-mark / routing-table allocation
//!
//! The kernel has no reservation API for fwmark values or table ids, so the
//! daemon derives the used sets from `rule_list()` and `route_list()` at
//! every allocation and picks the smallest free pair. Between that listing
//! and `rule_add` another process can claim the same value; the kernel then
//! answers EEXIST and the allocator retries with the next candidate.

use std::collections::HashSet;

use tracing::debug;

use crate::error::{GroupError, NetfilterError};
use crate::nf::NetfilterDriver;

/// Values never handed out: 0 plus the kernel's default/main/local tables
pub const RESERVED: [u32; 4] = [0, 253, 254, 255];

/// Routing table ids are limited to the rtnetlink 10-bit range
pub const MAX_TABLE: u32 = 0x3FF;

/// Claim an unused (fwmark, table) pair by installing its policy rule
///
/// On success the rule `fwmark mark → lookup table` is already in the
/// kernel; the caller owns it and must `rule_del` it on unwind.
pub async fn claim(driver: &dyn NetfilterDriver) -> Result<(u32, u32), GroupError> {
    let mut used_marks: HashSet<u32> = RESERVED.into_iter().collect();
    let mut used_tables: HashSet<u32> = RESERVED.into_iter().collect();

    for rule in driver.rule_list().await.map_err(GroupError::Netfilter)? {
        used_marks.insert(rule.mark);
        used_tables.insert(rule.table);
    }
    for route in driver.route_list().await.map_err(GroupError::Netfilter)? {
        used_tables.insert(route.table);
    }

    loop {
        let mark = smallest_free(&used_marks, u32::MAX).ok_or(GroupError::NoFreeMark)?;
        let table = smallest_free(&used_tables, MAX_TABLE).ok_or(GroupError::NoFreeTable)?;

        match driver.rule_add(mark, table).await {
            Ok(()) => {
                debug!(mark, table, "claimed mark/table pair");
                return Ok((mark, table));
            }
            Err(NetfilterError::AlreadyExists(_)) => {
                // Lost the race; both values are burned for this pass.
                used_marks.insert(mark);
                used_tables.insert(table);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn smallest_free(used: &HashSet<u32>, cap: u32) -> Option<u32> {
    (1..=cap).find(|candidate| !used.contains(candidate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nf::MemoryDriver;
    use ipnet::Ipv4Net;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn test_claim_first_pair() {
        let driver = MemoryDriver::new();
        let (mark, table) = claim(&driver).await.unwrap();
        assert_eq!((mark, table), (1, 1));
        assert_eq!(driver.policy_rules().len(), 1);
    }

    #[tokio::test]
    async fn test_claim_skips_used_values() {
        let driver = MemoryDriver::new();
        driver.rule_add(1, 1).await.unwrap();
        driver.rule_add(2, 5).await.unwrap();
        let (mark, table) = claim(&driver).await.unwrap();
        assert_eq!((mark, table), (3, 2));
    }

    #[tokio::test]
    async fn test_claim_skips_reserved_tables() {
        let driver = MemoryDriver::new();
        for table in 1..=252u32 {
            driver.rule_add(1000 + table, table).await.unwrap();
        }
        let (_, table) = claim(&driver).await.unwrap();
        assert_eq!(table, 256, "253-255 are reserved");
    }

    #[tokio::test]
    async fn test_claim_sees_route_tables() {
        let driver = MemoryDriver::new();
        driver
            .route_add(&crate::nf::RouteSpec {
                link_index: 3,
                table: 1,
                dst: Ipv4Net::new(Ipv4Addr::UNSPECIFIED, 0).unwrap(),
            })
            .await
            .unwrap();
        let (mark, table) = claim(&driver).await.unwrap();
        assert_eq!(mark, 1);
        assert_eq!(table, 2);
    }

    #[tokio::test]
    async fn test_table_exhaustion() {
        let driver = MemoryDriver::new();
        for table in 1..=MAX_TABLE {
            if !RESERVED.contains(&table) {
                driver.rule_add(10_000 + table, table).await.unwrap();
            }
        }
        let err = claim(&driver).await.unwrap_err();
        assert!(matches!(err, GroupError::NoFreeTable));
    }
}
