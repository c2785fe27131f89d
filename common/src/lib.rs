// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Types shared by the anvil provisioning orchestrator and its
//! virtualization backend client: the control-plane error taxonomy,
//! resource quantities, VM name handling, and the bounded poll
//! primitive that backs every wait loop in the system.

pub mod dev;
pub mod error;
pub mod poll;
pub mod resources;
pub mod vm_name;

pub use error::Error;
pub use error::ResourceType;
pub use resources::Resources;
pub use vm_name::VmName;
