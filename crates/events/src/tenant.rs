use jobwatch_core::TenantId;

use crate::{EventEnvelope, FeedSnapshot};

/// Anything that can say which tenant it belongs to.
///
/// One bus may carry several tenants' traffic; consumers compare this against
/// their own tenant and drop the rest.
pub trait TenantScoped {
    fn tenant_id(&self) -> TenantId;

    fn belongs_to(&self, tenant_id: TenantId) -> bool {
        self.tenant_id() == tenant_id
    }
}

impl<E> TenantScoped for EventEnvelope<E> {
    fn tenant_id(&self) -> TenantId {
        EventEnvelope::tenant_id(self)
    }
}

impl TenantScoped for FeedSnapshot {
    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}
