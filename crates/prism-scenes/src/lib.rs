//! Demo scenes for the prism sandbox.
//!
//! Each scene acquires its own device and surfaces on mount and gives every
//! one of them back through its cleanup, so switching scenes never leaks GPU
//! state into the next one.

mod common;

pub mod msdf_text;
pub mod multi_canvas;
pub mod particles;
pub mod points;
pub mod textured_cube;

use std::rc::Rc;

use prism_engine::device::WgpuBackend;
use prism_engine::scene::Scene;

pub use common::SceneSettings;

/// Every scene, in selector order. The first entry is the default.
pub fn catalog(settings: SceneSettings) -> Vec<Rc<dyn Scene<WgpuBackend>>> {
    vec![
        Rc::new(textured_cube::TexturedCubeScene {
            settings,
            options: Default::default(),
        }),
        Rc::new(points::PointsScene {
            settings,
            options: Default::default(),
        }),
        Rc::new(particles::ParticlesScene {
            settings,
            options: Default::default(),
        }),
        Rc::new(multi_canvas::MultiCanvasScene {
            settings,
            options: Default::default(),
        }),
        Rc::new(msdf_text::MsdfTextScene {
            settings,
            options: Default::default(),
        }),
    ]
}
