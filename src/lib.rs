#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod api;
pub mod auth;
pub mod catalog;
pub mod cli;
pub mod cloudinit;
pub mod config;
pub mod disk;
pub mod domain_xml;
pub mod error;
pub mod hypervisor;
pub mod iso9660;
pub mod nat;
pub mod ports;
pub mod provision;
pub mod resolver;
