//! `gremlin` - inject failures into a service mesh and check how it copes

mod commands;
mod load;
mod output;

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use clap::builder::BoolishValueParser;
use clap::{value_parser, Arg, ArgAction, ArgGroup, ArgMatches, Command};
use commands::{CheckArgs, RecipeArgs, RecipeOutcome, TrafficCommand, DEFAULT_HEADER};
use gremlin_core::routing::DEFAULT_TRAFFIC_STEP;
use gremlin_core::{ControlPlane, LoadTrigger, LogStore, RecipeId, RunConfig, TrafficShifter};
use gremlin_http::{ElasticLogStore, HttpConfig, HttpControlPlane, HttpServiceRegistry};
use load::{ManualLoad, ScriptLoad};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn cli() -> Command {
    let run_timing = [
        Arg::new("grace")
            .long("grace")
            .default_value("3")
            .value_parser(value_parser!(u64))
            .help("Seconds to wait for rules to propagate before load starts"),
        Arg::new("flush")
            .long("flush")
            .default_value("5")
            .value_parser(value_parser!(u64))
            .help("Seconds to wait for logs to reach the log server after load"),
    ];

    Command::new("gremlin")
        .version(gremlin_core::VERSION)
        .about("Inject failures into a microservice mesh and check how the services cope")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("debug")
                .long("debug")
                .env("A8_DEBUG")
                .global(true)
                .action(ArgAction::SetTrue)
                .value_parser(BoolishValueParser::new())
                .help("Log every request sent to the controller, registry and log server"),
        )
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .env("GREMLIN_LOG_JSON")
                .global(true)
                .action(ArgAction::SetTrue)
                .value_parser(BoolishValueParser::new())
                .help("Emit diagnostics as JSON lines"),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Print results as JSON instead of tables"),
        )
        .arg(
            Arg::new("controller-url")
                .long("controller-url")
                .env("A8_CONTROLLER_URL")
                .global(true)
                .default_value("http://localhost:31200")
                .help("URL of the mesh controller"),
        )
        .arg(
            Arg::new("controller-token")
                .long("controller-token")
                .env("A8_CONTROLLER_TOKEN")
                .hide_env_values(true)
                .global(true)
                .help("Bearer token for the mesh controller"),
        )
        .arg(
            Arg::new("registry-url")
                .long("registry-url")
                .env("A8_REGISTRY_URL")
                .global(true)
                .default_value("http://localhost:31300")
                .help("URL of the service registry"),
        )
        .arg(
            Arg::new("registry-token")
                .long("registry-token")
                .env("A8_REGISTRY_TOKEN")
                .hide_env_values(true)
                .global(true)
                .help("Bearer token for the service registry"),
        )
        .arg(
            Arg::new("log-server")
                .long("log-server")
                .env("A8_LOG_SERVER")
                .global(true)
                .default_value("localhost:30200")
                .help("Elasticsearch-compatible server holding request logs"),
        )
        .arg(
            Arg::new("index")
                .long("index")
                .global(true)
                .help("Log index to search (default: all indices)"),
        )
        .subcommand(
            Command::new("recipe-run")
                .about("Inject the failure scenarios, drive load, check assertions, remove the rules")
                .arg(
                    Arg::new("topology")
                        .long("topology")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Application topology (JSON or YAML)"),
                )
                .arg(
                    Arg::new("scenarios")
                        .long("scenarios")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Failure scenarios (JSON or YAML)"),
                )
                .arg(
                    Arg::new("checks")
                        .long("checks")
                        .value_parser(value_parser!(PathBuf))
                        .help("Assertions on service behavior during the failure"),
                )
                .arg(
                    Arg::new("run-load-script")
                        .long("run-load-script")
                        .value_parser(value_parser!(PathBuf))
                        .help("Script that sends test traffic; without it you are prompted"),
                )
                .arg(
                    Arg::new("header")
                        .long("header")
                        .default_value(DEFAULT_HEADER)
                        .help("Request tracking header used by the application"),
                )
                .arg(
                    Arg::new("pattern")
                        .long("pattern")
                        .default_value("*")
                        .help("Only fault requests whose tracking header matches this pattern"),
                )
                .arg(
                    Arg::new("dry-run")
                        .long("dry-run")
                        .action(ArgAction::SetTrue)
                        .help("Print the rules that would be installed and exit"),
                )
                .args(run_timing),
        )
        .subcommand(
            Command::new("check")
                .about("Evaluate a checklist against request logs already collected")
                .arg(
                    Arg::new("checks")
                        .long("checks")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Assertions to evaluate"),
                )
                .arg(
                    Arg::new("recipe")
                        .long("recipe")
                        .value_parser(value_parser!(RecipeId))
                        .help("Recipe id whose traces to check"),
                )
                .arg(
                    Arg::new("header")
                        .long("header")
                        .default_value(DEFAULT_HEADER)
                        .help("Log field holding the request tracking header"),
                )
                .arg(
                    Arg::new("pattern")
                        .long("pattern")
                        .help("Only check requests whose tracking header matches this pattern"),
                )
                .arg(
                    Arg::new("since")
                        .long("since")
                        .value_parser(value_parser!(DateTime<Utc>))
                        .help("Ignore requests logged before this RFC 3339 time"),
                )
                .arg(
                    Arg::new("until")
                        .long("until")
                        .value_parser(value_parser!(DateTime<Utc>))
                        .help("Ignore requests logged after this RFC 3339 time"),
                )
                .arg(
                    Arg::new("stop-on-failure")
                        .long("stop-on-failure")
                        .action(ArgAction::SetTrue)
                        .help("Stop at the first failing assertion"),
                )
                .group(
                    ArgGroup::new("scope")
                        .args(["recipe", "pattern"])
                        .multiple(true)
                        .required(true),
                ),
        )
        .subcommand(
            Command::new("rules")
                .about("Inspect and remove fault rules")
                .subcommand_required(true)
                .subcommand(Command::new("list").about("List installed rules"))
                .subcommand(
                    Command::new("delete")
                        .about("Delete rules by id or by recipe tag")
                        .arg(Arg::new("id").long("id").help("Rule id"))
                        .arg(Arg::new("tag").long("tag").help("Recipe id the rules are tagged with"))
                        .group(ArgGroup::new("target").args(["id", "tag"]).required(true)),
                )
                .subcommand(Command::new("clear").about("Delete every installed rule")),
        )
        .subcommand(Command::new("service-list").about("List services and their instance versions"))
        .subcommand(
            Command::new("traffic-start")
                .about("Start moving traffic to a new version of a service")
                .arg(Arg::new("service").required(true).help("Service name"))
                .arg(Arg::new("version").required(true).help("Version to move traffic to"))
                .arg(
                    Arg::new("amount")
                        .long("amount")
                        .default_value("10")
                        .value_parser(value_parser!(u32).range(0..=100))
                        .help("Percentage of traffic for the new version"),
                ),
        )
        .subcommand(
            Command::new("traffic-step")
                .about("Move more traffic to the version being rolled out")
                .arg(Arg::new("service").required(true).help("Service name"))
                .arg(
                    Arg::new("amount")
                        .long("amount")
                        .value_parser(value_parser!(u32).range(0..=100))
                        .help(format!(
                            "Percentage of traffic for the new version (default: current + {DEFAULT_TRAFFIC_STEP})"
                        )),
                ),
        )
        .subcommand(
            Command::new("traffic-abort")
                .about("Send all traffic back to the default version")
                .arg(Arg::new("service").required(true).help("Service name")),
        )
}

fn init_tracing(matches: &ArgMatches) {
    let default_level = if matches.get_flag("debug") { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let registry = tracing_subscriber::registry().with(filter);
    if matches.get_flag("log-json") {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Connection settings taken from the global flags
struct Endpoints {
    controller: HttpConfig,
    registry: HttpConfig,
    log_server: String,
    index: Option<String>,
}

impl Endpoints {
    fn from_matches(matches: &ArgMatches) -> anyhow::Result<Self> {
        Ok(Self {
            controller: HttpConfig::new(required(matches, "controller-url")?)
                .with_token(matches.get_one::<String>("controller-token").cloned()),
            registry: HttpConfig::new(required(matches, "registry-url")?)
                .with_token(matches.get_one::<String>("registry-token").cloned()),
            log_server: required(matches, "log-server")?.to_string(),
            index: matches.get_one::<String>("index").cloned(),
        })
    }

    fn control(&self) -> anyhow::Result<HttpControlPlane> {
        Ok(HttpControlPlane::new(&self.controller)?)
    }

    fn log_store(&self, server: Option<&str>) -> anyhow::Result<Arc<dyn LogStore>> {
        let server = server.unwrap_or(&self.log_server);
        tracing::debug!(server, "using log server");
        Ok(Arc::new(ElasticLogStore::new(
            &HttpConfig::new(server),
            self.index.as_deref(),
        )?))
    }
}

fn required<'a>(matches: &'a ArgMatches, name: &str) -> anyhow::Result<&'a str> {
    matches
        .get_one::<String>(name)
        .map(String::as_str)
        .ok_or_else(|| anyhow!("--{name} is required"))
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", output::to_json(value)?);
    Ok(())
}

fn run(matches: &ArgMatches) -> anyhow::Result<ExitCode> {
    let endpoints = Endpoints::from_matches(matches)?;
    let json = matches.get_flag("json");

    match matches.subcommand() {
        Some(("recipe-run", args)) => {
            let recipe = RecipeArgs {
                topology: args.get_one::<PathBuf>("topology").cloned().context("--topology is required")?,
                scenarios: args.get_one::<PathBuf>("scenarios").cloned().context("--scenarios is required")?,
                checks: args.get_one::<PathBuf>("checks").cloned(),
                header: required(args, "header")?.to_string(),
                pattern: required(args, "pattern")?.to_string(),
                dry_run: args.get_flag("dry-run"),
                run: RunConfig {
                    propagation_grace: Duration::from_secs(args.get_one::<u64>("grace").copied().unwrap_or(3)),
                    flush_interval: Duration::from_secs(args.get_one::<u64>("flush").copied().unwrap_or(5)),
                    continue_on_error: true,
                },
            };
            let mut load: Box<dyn LoadTrigger> = match args.get_one::<PathBuf>("run-load-script") {
                Some(script) => Box::new(ScriptLoad::new(script)),
                None => Box::new(ManualLoad::new(
                    std::io::stdin().lock(),
                    &recipe.header,
                    &recipe.pattern,
                )),
            };
            let control: Arc<dyn ControlPlane> = Arc::new(endpoints.control()?);

            match commands::recipe_run(&recipe, control, |server| endpoints.log_store(server), load.as_mut())? {
                RecipeOutcome::Planned(rules) => print_json(&rules)?,
                RecipeOutcome::Ran(report) => {
                    if json {
                        print_json(&report.results)?;
                    } else {
                        println!("Recipe {}: {} rules installed", report.recipe_id, report.rules_installed);
                        if !report.results.is_empty() {
                            print!("{}", output::results_table(&report.results).render());
                        }
                    }
                    if !report.teardown.is_clean() {
                        eprintln!(
                            "warning: {} rules could not be removed; run `gremlin rules delete --tag {}`",
                            report.teardown.failed.len(),
                            report.recipe_id
                        );
                    }
                    if !report.all_passed() {
                        return Ok(ExitCode::from(1));
                    }
                }
            }
        }
        Some(("check", args)) => {
            let check = CheckArgs {
                checks: args.get_one::<PathBuf>("checks").cloned().context("--checks is required")?,
                recipe: args.get_one::<RecipeId>("recipe").copied(),
                header: required(args, "header")?.to_string(),
                pattern: args.get_one::<String>("pattern").cloned(),
                since: args.get_one::<DateTime<Utc>>("since").copied(),
                until: args.get_one::<DateTime<Utc>>("until").copied(),
                stop_on_failure: args.get_flag("stop-on-failure"),
            };
            let results = commands::check(&check, |server| endpoints.log_store(server))?;
            if json {
                print_json(&results)?;
            } else {
                print!("{}", output::results_table(&results).render());
            }
            if !results.iter().all(|r| r.success) {
                return Ok(ExitCode::from(1));
            }
        }
        Some(("rules", args)) => {
            let control = endpoints.control()?;
            match args.subcommand() {
                Some(("list", _)) => {
                    let rules = control.list_rules()?;
                    if json {
                        print_json(&rules)?;
                    } else {
                        print!("{}", output::rules_table(&rules).render());
                    }
                }
                Some(("delete", delete)) => {
                    if let Some(id) = delete.get_one::<String>("id") {
                        control.delete_rule(id)?;
                        println!("Deleted fault injection rule with id: {id}");
                    } else if let Some(tag) = delete.get_one::<String>("tag") {
                        control.delete_rules_by_tag(tag)?;
                        println!("Deleted fault injection rules tagged: {tag}");
                    }
                }
                Some(("clear", _)) => {
                    control.clear_rules()?;
                    println!("Cleared fault injection rules from all microservices");
                }
                _ => return Err(anyhow!("missing rules subcommand")),
            }
        }
        Some(("service-list", _)) => {
            let registry = HttpServiceRegistry::new(&endpoints.registry)?;
            let services = commands::service_list(&registry)?;
            if json {
                print_json(&services)?;
            } else {
                print!("{}", output::services_table(&services).render());
            }
        }
        Some((name @ ("traffic-start" | "traffic-step" | "traffic-abort"), args)) => {
            let service = required(args, "service")?;
            let command = match name {
                "traffic-start" => TrafficCommand::Start {
                    version: required(args, "version")?.to_string(),
                    amount: args.get_one::<u32>("amount").copied().unwrap_or(DEFAULT_TRAFFIC_STEP),
                },
                "traffic-step" => TrafficCommand::Step {
                    amount: args.get_one::<u32>("amount").copied(),
                },
                _ => TrafficCommand::Abort,
            };
            let shifter = TrafficShifter::new(
                Arc::new(endpoints.control()?),
                Arc::new(HttpServiceRegistry::new(&endpoints.registry)?),
            );
            println!("{}", commands::traffic(&shifter, service, &command)?);
        }
        _ => return Err(anyhow!("missing subcommand")),
    }
    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    let matches = cli().get_matches();
    init_tracing(&matches);

    match run(&matches) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("error: {e:#}");
            ExitCode::from(2)
        }
    }
}
