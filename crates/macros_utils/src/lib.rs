/// Collect actix handlers declared in a module into a `routes` configurator.
///
/// ```ignore
/// macros_utils::routes! {
///     route health_route,
///     route check_route,
/// }
/// ```
#[cfg(feature = "actix")]
#[macro_export]
macro_rules! routes {
    ($(route $handler:ident),* $(,)?) => {
        pub fn routes(cfg: &mut $crate::actix_web::web::ServiceConfig) {
            $( cfg.service($handler); )*
        }
    };
}

#[cfg(feature = "actix")]
pub use actix_web;
