mod check;
mod health;

use actix_web::web::ServiceConfig;

pub fn routes(cfg: &mut ServiceConfig) {
    health::routes(cfg);
    check::routes(cfg);
}
