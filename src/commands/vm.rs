use std::io::{self, BufRead, Write};
use std::os::unix::process::CommandExt;
use std::process::Command;

use devctl::deploy::{Deployment, IsolatedDeployment};
use devctl::vm::{LimaVm, VmStatus, LIMACTL};
use devctl::DevError;

use super::DevContext;
use crate::cli::VmCmd;

fn require_limactl() -> Result<(), DevError> {
    if LimaVm::tool_available() {
        Ok(())
    } else {
        Err(DevError::prerequisite(
            "limactl not found.",
            &["Install Lima: brew install lima"],
        ))
    }
}

/// `rustc`, kernel and `node` versions as seen inside the VM.
fn provisioning_report(ctx: &DevContext, vm: &LimaVm) {
    let probes = [
        ("rust", "rustc --version"),
        ("kernel", "uname -r"),
        ("node", "node --version"),
    ];
    for (label, script) in probes {
        match vm.run(vm.bash(script).capture_output(true)) {
            Ok(out) if out.status.success() => println!("  {label:<7} {}", out.stdout_trimmed()),
            _ => ctx.warn(&format!("{label} not found in the VM; provisioning may have failed")),
        }
    }
}

fn create(ctx: &DevContext) -> Result<(), DevError> {
    require_limactl()?;
    let vm = LimaVm::new(ctx.config.vm.name.clone());
    match vm.status() {
        VmStatus::Running => {
            ctx.ok(&format!("VM '{}' already exists and is running", ctx.config.vm.name));
            return Ok(());
        }
        VmStatus::Stopped(_) => {
            ctx.info(&format!("VM '{}' exists; starting it", ctx.config.vm.name));
            vm.start()?;
            ctx.ok("VM is running");
            return Ok(());
        }
        VmStatus::Missing | VmStatus::NoTool => {}
    }
    let template = ctx.path(&ctx.config.vm.template);
    if !template.is_file() {
        return Err(DevError::prerequisite(
            format!("Lima template not found: {}", template.display()),
            &["Set vm.template in devctl.yaml"],
        ));
    }
    ctx.info(&format!(
        "creating VM '{}' from {}",
        ctx.config.vm.name,
        template.display()
    ));
    vm.create(&template)?;
    ctx.info("starting VM");
    vm.start()?;
    println!("provisioning:");
    provisioning_report(ctx, &vm);
    ctx.ok(&format!("VM '{}' is ready", ctx.config.vm.name));
    Ok(())
}

fn shell(ctx: &DevContext) -> Result<(), DevError> {
    require_limactl()?;
    let vm = LimaVm::new(ctx.config.vm.name.clone());
    vm.ensure_running()?;
    let err = Command::new(LIMACTL)
        .args(["shell", "--workdir", "/", ctx.config.vm.name.as_str()])
        .exec();
    // exec only returns on failure.
    Err(DevError::Io(err))
}

fn confirm(prompt: &str) -> io::Result<bool> {
    if !atty::is(atty::Stream::Stdin) {
        return Ok(false);
    }
    eprint!("{prompt} [y/N] ");
    io::stderr().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

fn destroy(ctx: &DevContext, yes: bool) -> Result<(), DevError> {
    require_limactl()?;
    let vm = LimaVm::new(ctx.config.vm.name.clone());
    let status = vm.status();
    if status == VmStatus::Missing {
        ctx.info(&format!("VM '{}' does not exist", ctx.config.vm.name));
        return Ok(());
    }
    if !yes
        && !confirm(&format!(
            "Delete VM '{}' and everything in it?",
            ctx.config.vm.name
        ))?
    {
        return Err(DevError::prerequisite(
            "VM deletion not confirmed.",
            &["Re-run with --yes to skip the prompt"],
        ));
    }
    if status == VmStatus::Running {
        if let Err(e) = IsolatedDeployment::new(&ctx.root, &ctx.config).stop() {
            tracing::debug!(error = %e, "service stop before VM delete failed");
        }
    }
    ctx.info(&format!("deleting VM '{}'", ctx.config.vm.name));
    vm.delete()?;
    ctx.ok("VM deleted");
    Ok(())
}

pub(crate) fn run(ctx: &DevContext, cmd: &VmCmd) -> Result<(), DevError> {
    match cmd {
        VmCmd::Create => create(ctx),
        VmCmd::Shell => shell(ctx),
        VmCmd::Destroy { yes } => destroy(ctx, *yes),
    }
}
