//! Persistence interfaces consumed by the rest of the crate, §4.5/§4.11.
//!
//! The server core never talks to a concrete database: everything it
//! needs is expressed as a narrow `async_trait`, the way the teacher's
//! `AppState` abstracted agent storage. Production deployments wire in
//! their own implementations; the `memory` submodule provides
//! in-process fakes for tests and for running the server with no
//! external store at all.

use crate::plan::{ApiTokenRecord, Plan};
use async_trait::async_trait;
use std::net::IpAddr;
use std::time::SystemTime;

#[async_trait]
pub trait ApiTokenRepo: Send + Sync {
    async fn find_by_hash(&self, token_hash: &str) -> Option<ApiTokenRecord>;
}

#[async_trait]
pub trait UserRepo: Send + Sync {
    async fn plan_for_user(&self, user_id: &str) -> Option<Plan>;
}

#[async_trait]
pub trait PlanRepo: Send + Sync {
    async fn find_by_name(&self, name: &str) -> Option<Plan>;
}

#[derive(Debug, Clone)]
pub struct CustomDomainRecord {
    pub domain: String,
    pub subdomain: String,
    pub user_id: String,
}

#[async_trait]
pub trait CustomDomainRepo: Send + Sync {
    async fn find_by_domain(&self, domain: &str) -> Option<CustomDomainRecord>;
}

#[derive(Debug, Clone)]
pub struct StoredCert {
    pub domain: String,
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
    pub not_after: SystemTime,
}

#[async_trait]
pub trait TlsCertRepo: Send + Sync {
    async fn find(&self, domain: &str) -> Option<StoredCert>;
    async fn store(&self, cert: StoredCert);
}

#[derive(Debug, Clone)]
pub struct ExchangeRecord {
    pub tunnel_id: String,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub remote_ip: IpAddr,
    pub request_body: Vec<u8>,
    pub response_body: Vec<u8>,
    pub request_headers: Vec<(String, String)>,
    pub response_headers: Vec<(String, String)>,
    pub started_at: SystemTime,
    pub duration_ms: u64,
}

/// Sink for inspected HTTP exchanges, §4.11. Persistence is fire-and-forget
/// from the inspector's point of view — a slow or failing repo must never
/// block proxying.
#[async_trait]
pub trait ExchangeRepo: Send + Sync {
    async fn record(&self, exchange: ExchangeRecord);
}

pub mod memory {
    //! In-memory fakes, used by integration tests and by a server run
    //! with no external persistence configured.

    use super::*;
    use dashmap::DashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct InMemoryApiTokenRepo {
        records: DashMap<String, ApiTokenRecord>,
    }

    impl InMemoryApiTokenRepo {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert(&self, record: ApiTokenRecord) {
            self.records.insert(record.token_hash.clone(), record);
        }
    }

    #[async_trait]
    impl ApiTokenRepo for InMemoryApiTokenRepo {
        async fn find_by_hash(&self, token_hash: &str) -> Option<ApiTokenRecord> {
            self.records.get(token_hash).map(|r| r.clone())
        }
    }

    #[derive(Default)]
    pub struct InMemoryUserRepo {
        plans: DashMap<String, Plan>,
    }

    impl InMemoryUserRepo {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert(&self, user_id: impl Into<String>, plan: Plan) {
            self.plans.insert(user_id.into(), plan);
        }
    }

    #[async_trait]
    impl UserRepo for InMemoryUserRepo {
        async fn plan_for_user(&self, user_id: &str) -> Option<Plan> {
            self.plans.get(user_id).map(|p| p.clone())
        }
    }

    #[derive(Default)]
    pub struct InMemoryCustomDomainRepo {
        domains: DashMap<String, CustomDomainRecord>,
    }

    impl InMemoryCustomDomainRepo {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert(&self, record: CustomDomainRecord) {
            self.domains.insert(record.domain.clone(), record);
        }
    }

    #[async_trait]
    impl CustomDomainRepo for InMemoryCustomDomainRepo {
        async fn find_by_domain(&self, domain: &str) -> Option<CustomDomainRecord> {
            self.domains.get(domain).map(|d| d.clone())
        }
    }

    #[derive(Default)]
    pub struct InMemoryExchangeRepo {
        pub exchanges: Mutex<Vec<ExchangeRecord>>,
    }

    impl InMemoryExchangeRepo {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl ExchangeRepo for InMemoryExchangeRepo {
        async fn record(&self, exchange: ExchangeRecord) {
            self.exchanges.lock().expect("exchange repo mutex poisoned").push(exchange);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::*;
    use super::*;

    #[tokio::test]
    async fn in_memory_token_repo_round_trips() {
        let repo = InMemoryApiTokenRepo::new();
        repo.insert(ApiTokenRecord {
            token_hash: "abc123".into(),
            user_id: "u1".into(),
            plan: Plan::anonymous(),
            allowed_subdomain_patterns: vec![],
            allowed_ips: vec![],
        });
        assert!(repo.find_by_hash("abc123").await.is_some());
        assert!(repo.find_by_hash("missing").await.is_none());
    }
}
