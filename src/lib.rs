//! SMStoXMPP: bridges SMS gateway devices with one chat identity per device.
//!
//! A [`supervisor::Supervisor`] runs one [`worker::DeviceWorker`] per
//! configured device, plus a log collector, an optional contacts resolver
//! and an optional HTTP listener. Units only talk to each other through the
//! partitioned [`bus::Bus`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod app;
pub mod bus;
pub mod config;
pub mod logging;

pub mod chat;
pub mod contacts;
pub mod gateway;

pub mod listener;
pub mod supervisor;
pub mod worker;
