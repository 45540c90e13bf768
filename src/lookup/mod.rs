//! External GeoIP and NAT-type collaborators.

pub mod geoip;
pub mod nat;

pub use geoip::{DisabledGeoIp, GeoIpLookup, HttpGeoIp};
pub use nat::{DisabledNat, NatTypeLookup, StunNatProbe};
