pub mod ingress;
pub mod tunnel;
