//! Local hypervisor toolstack adapters

mod xen;

pub use xen::{Domain, DomainList, XenToolstack};
