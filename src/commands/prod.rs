use devctl::deploy::{
    self, overrides, DaemonDeployment, Deployment, IsolatedDeployment, LocalHost,
    NativeDeployment,
};
use devctl::detect::{self, DeploymentTarget, SystemProbe};
use devctl::vm::LimaVm;
use devctl::DevError;

use super::DevContext;
use crate::cli::ProdCmd;

fn no_target() -> DevError {
    DevError::prerequisite(
        "No production target on this host: systemd is not PID 1 and no Lima VM exists.",
        &[
            "Install Lima: brew install lima",
            "Create the VM: devctl vm create",
        ],
    )
}

fn deployment_for<'a>(
    ctx: &'a DevContext,
    target: DeploymentTarget,
) -> Result<Box<dyn Deployment + 'a>, DevError> {
    match target {
        DeploymentTarget::Native => Ok(Box::new(NativeDeployment::new(
            &ctx.root,
            &ctx.config,
            &ctx.data_dir,
        ))),
        DeploymentTarget::Isolated => Ok(Box::new(IsolatedDeployment::new(&ctx.root, &ctx.config))),
        DeploymentTarget::Daemon => Ok(Box::new(DaemonDeployment::new(
            &ctx.root,
            &ctx.config,
            &ctx.data_dir,
        ))),
        DeploymentTarget::Undetermined => Err(no_target()),
    }
}

/// Detect for an operation that will touch the target; a stopped VM is started.
fn active_target(ctx: &DevContext) -> Result<DeploymentTarget, DevError> {
    let vm = LimaVm::new(ctx.config.vm.name.clone());
    Ok(detect::detect(&SystemProbe::new(&vm))?)
}

fn passive_target(ctx: &DevContext) -> DeploymentTarget {
    let vm = LimaVm::new(ctx.config.vm.name.clone());
    detect::detect_passive(&SystemProbe::new(&vm))
}

/// Overrides are systemd drop-ins on this host, so they only make sense for a native install.
fn require_native(ctx: &DevContext) -> Result<(), DevError> {
    match passive_target(ctx) {
        DeploymentTarget::Native => Ok(()),
        other => Err(DevError::prerequisite(
            format!("Environment overrides need a native systemd install; this host deploys to: {other}."),
            &["Edit the environment file used by the service instead"],
        )),
    }
}

fn print_status(target: DeploymentTarget, lines: &[(String, String)]) {
    println!("target:    {target}");
    for (label, value) in lines {
        println!("{:<10} {value}", format!("{label}:"));
    }
}

pub(crate) fn run(ctx: &DevContext, cmd: &ProdCmd) -> Result<(), DevError> {
    match cmd {
        ProdCmd::Build { tag, debug } => {
            let target = active_target(ctx)?;
            let deployment = deployment_for(ctx, target)?;
            let release = deploy::resolve_release(&ctx.root, tag.as_deref())?;
            ctx.info(&format!("building {} for {target}", release.version));
            let artifact = deployment.build(&release, *debug)?;
            ctx.ok(&format!("artifact: {}", artifact.path));
            println!("{}", artifact.path);
            Ok(())
        }
        ProdCmd::Deploy {
            tag,
            debug,
            skip_checks,
        } => {
            // Resolve first: a missing tag should fail before minutes of checks.
            let release = deploy::resolve_release(&ctx.root, tag.as_deref())?;
            if *skip_checks {
                ctx.warn("skipping pre-deploy checks");
            } else {
                devctl::checks::run_checks(&ctx.runner, &ctx.root, &ctx.config.checks, ctx.use_err)?;
            }
            let target = active_target(ctx)?;
            let deployment = deployment_for(ctx, target)?;
            let report = deploy::run(deployment.as_ref(), &release, *debug)?;
            ctx.ok(&format!(
                "deployed {} to {} ({})",
                report.version, report.target, report.activation
            ));
            if let Some(observed) = report.observed_version.as_deref() {
                if observed != report.version {
                    ctx.warn(&format!(
                        "service reports version {observed}, expected {}",
                        report.version
                    ));
                }
            }
            Ok(())
        }
        ProdCmd::Status => {
            let target = passive_target(ctx);
            if target == DeploymentTarget::Undetermined {
                print_status(target, &[]);
                return Ok(());
            }
            let deployment = deployment_for(ctx, target)?;
            let lines = deployment.status()?;
            print_status(target, &lines);
            Ok(())
        }
        ProdCmd::Stop => {
            let target = passive_target(ctx);
            let deployment = deployment_for(ctx, target)?;
            deployment.stop()?;
            ctx.ok(&format!("production service stopped ({target})"));
            Ok(())
        }
        ProdCmd::Set { name, value } => {
            require_native(ctx)?;
            overrides::set(&LocalHost::new(), &ctx.config.service_name, name, value)?;
            ctx.ok(&format!("{name} set; {} restarted", ctx.config.service_name));
            Ok(())
        }
        ProdCmd::Unset { name } => {
            require_native(ctx)?;
            if overrides::unset(&LocalHost::new(), &ctx.config.service_name, name)? {
                ctx.ok(&format!("{name} removed; {} restarted", ctx.config.service_name));
            } else {
                ctx.info(&format!("no override named {name}"));
            }
            Ok(())
        }
        ProdCmd::Overrides => {
            require_native(ctx)?;
            let found = overrides::list(&LocalHost::new(), &ctx.config.service_name)?;
            if found.is_empty() {
                ctx.info("no environment overrides");
            }
            for o in found {
                println!("{}={}", o.name, o.value);
            }
            Ok(())
        }
    }
}
