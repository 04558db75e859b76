//! Entities, value objects and the ports the application layer depends on.

pub mod account;
pub mod audit;
pub mod customer;
pub mod gateway;
pub mod inventory;
pub mod money;
pub mod order;
pub mod payment;
pub mod ports;
pub mod risk;
pub mod transaction;
