//! Early OS bring-up: pseudo-filesystems, `/dev` links and root growth.

pub mod gpt;
pub mod grow;
pub mod links;
pub mod mounts;
pub mod nvme;

pub use grow::grow_root;
pub use links::{link_ebs_devices, link_standard_fds};
pub use mounts::mount_pseudo_filesystems;
