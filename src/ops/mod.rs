pub mod aspect;
pub mod canvas_ops;
pub mod composite;
pub mod filters;
pub mod inpaint;
pub mod masks;
pub mod selection;
pub mod transform;
