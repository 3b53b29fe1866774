use ash::Entry;
use tracing_subscriber::EnvFilter;
use vk_boot::{BootstrapConfig, Session};
use winit::{
    dpi::PhysicalSize,
    event::{Event, KeyboardInput, StartCause, VirtualKeyCode, WindowEvent},
    event_loop::{ControlFlow, EventLoop},
    window::WindowBuilder,
};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = BootstrapConfig::new();
    let extent = config.extent();

    let event_loop = EventLoop::new();
    let window = WindowBuilder::new()
        .with_title("Vulkan")
        .with_inner_size(PhysicalSize::new(extent.width, extent.height))
        .with_resizable(false)
        .build(&event_loop)?;

    let entry = unsafe { Entry::load() }?;
    let session = unsafe { Session::new(entry, config, &window) }?;
    tracing::info!(
        device = %session.device_metadata().device_name(),
        images = session.swapchain().images().len(),
        shared_queue = session.device_metadata().queue_families().is_shared(),
        "ready"
    );

    let mut session = Some(session);
    event_loop.run(move |event, _, control_flow| match event {
        Event::NewEvents(StartCause::Init) => *control_flow = ControlFlow::Poll,
        Event::WindowEvent {
            event:
                WindowEvent::CloseRequested
                | WindowEvent::KeyboardInput {
                    input:
                        KeyboardInput {
                            virtual_keycode: Some(VirtualKeyCode::Escape),
                            ..
                        },
                    ..
                },
            ..
        } => {
            if let Some(session) = session.take() {
                session.destroy();
            }

            *control_flow = ControlFlow::Exit;
        }
        _ => (),
    });
}
