//! eudore demo: parameter rules, bind + validate, host routing, static files
//! and graceful restart.
//!
//! Run with:
//!   cargo run --example basic -- --addr 127.0.0.1:8080
//!
//! Try:
//!   curl http://localhost:8080/hello
//!   curl http://localhost:8080/users/42
//!   curl http://localhost:8080/users/0                   # 404, fails min=1
//!   curl -X PUT http://localhost:8080/users/42           # 405, Allow: GET, POST
//!   curl -X POST http://localhost:8080/users/42 \
//!        -H 'content-type: application/json' -d '{"Name":""}'   # 400
//!   curl -H 'Host: api.example.com' http://localhost:8080/
//!   kill -USR2 <pid>                                      # live restart

use std::path::PathBuf;

use clap::Parser;
use eudore::{App, AppOption, Config, Context, Error, StaticFiles, logging, middleware};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Parser)]
#[command(name = "basic")]
#[command(about = "eudore demo server", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    addr: String,

    /// TOML config; its [[listen]] entries are served too.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory served under /static/.
    #[arg(long, default_value = ".")]
    static_dir: PathBuf,
}

#[derive(Debug, Deserialize, Serialize)]
struct User {
    #[serde(rename = "Name")]
    name: String,
    #[serde(default)]
    age: u32,
}

async fn hello(ctx: &mut Context) {
    ctx.write_string("hi");
}

async fn get_user(ctx: &mut Context) -> Value {
    json!({
        "id": ctx.get_param("id"),
        "action": ctx.get_param("action"),
        "route": ctx.get_param("route"),
    })
}

async fn create_user(ctx: &mut Context, user: User) -> Result<Value, Error> {
    ctx.info(format_args!("creating {}", user.name));
    Ok(json!({ "id": ctx.get_param("id"), "user": user }))
}

async fn api_index(ctx: &mut Context) -> &'static str {
    ctx.set_header("x-served-by", "api");
    "api host"
}

async fn upload_file(ctx: &mut Context) {
    match ctx.form_file("file").await {
        Ok(Some(file)) => {
            let line = format!("{} {}B", file.filename, file.size());
            ctx.write_string(&line);
        }
        Ok(None) => ctx.write_status(http::StatusCode::BAD_REQUEST),
        Err(err) => ctx.fatal(err),
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    logging::init(&config.logger)?;

    let app = App::new().with([AppOption::Config(config)]);
    app.add_middleware([middleware::recover(), middleware::request_id(), middleware::logger()]);
    app.validator().register::<User>(&[("Name", "nozero"), ("age", "omitempty,max=200")]);

    let router = app.router();
    router
        .get("/hello", hello)
        .get("/users/:id|min=1 action=show", get_user)
        .post("/users/:id|min=1 action=create", create_user)
        .get("/ host=api.example.com,*.api.example.com", api_index)
        .get("/static/*", StaticFiles::new(cli.static_dir));

    let upload = router.group("/upload");
    upload.add_middleware("", vec![middleware::body_limit(1 << 20)]);
    upload.post("", upload_file);

    app.listen(&cli.addr).await;
    app.run().await
}
