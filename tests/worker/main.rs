mod bindings;
mod helpers;
mod lifecycle;
mod publishing;
