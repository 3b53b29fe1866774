#![allow(clippy::missing_safety_doc)]
#![warn(missing_docs)]
/*!
Vulkan bootstrapping for [`ash`]: from a window to a ready swapchain.

- Instance creation, with optional validation layers and a debug messenger
  that forwards to [`tracing`]
- Physical device probing and scoring against a surface
- Graphics and presentation queue family resolution
- Logical device creation and queue retrieval
- Swapchain format, present mode, extent and image count negotiation
- A [`Session`] that runs all of the above in order and tears everything
  down in reverse

## Cargo Features

- `surface` (enabled by default): Enables the use of [`raw-window-handle`]
  and [`Session::new`].

## Example

```rust,ignore
let entry = unsafe { ash::Entry::load() }?;
let config = BootstrapConfig::new().window_extent(800, 600);
let session = unsafe { Session::new(entry, config, &window) }?;

let queues = session.queues();
let swapchain = session.swapchain();
// record and submit work ...

session.destroy();
```

Lower level building blocks ([`InstanceBuilder`], [`DeviceBuilder`],
[`select_physical_device`], [`Swapchain`]) can be used on their own.

## Licensing

This project is licensed under the zlib License.

[`raw-window-handle`]: https://crates.io/crates/raw-window-handle
*/

pub mod config;
pub mod device;
pub mod instance;
pub mod probe;
pub mod queue;
pub mod session;
pub mod swapchain;

pub use config::*;
pub use device::*;
pub use instance::*;
pub use probe::*;
pub use queue::*;
pub use session::*;
pub use swapchain::*;

type BootstrapSmallVec<T> = smallvec::SmallVec<[T; 8]>;
