use clap::{Arg, ArgAction, Command};

fn prefix_list(id: &'static str, env: &'static str, help: &'static str, default: &'static str) -> Arg {
    Arg::new(id)
        .long(id)
        .help(help)
        .env(env)
        .value_delimiter(',')
        .action(ArgAction::Append)
        .default_values(default.split(','))
}

fn redirect(id: &'static str, env: &'static str, help: &'static str, default: &'static str) -> Arg {
    Arg::new(id).long(id).help(help).env(env).default_value(default)
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(prefix_list(
            "protected-routes",
            "STOREGATE_PROTECTED_ROUTES",
            "Path prefixes that need a session",
            "/account,/checkout,/orders",
        ))
        .arg(prefix_list(
            "admin-routes",
            "STOREGATE_ADMIN_ROUTES",
            "Path prefixes reserved to admins",
            "/admin,/api/admin",
        ))
        .arg(prefix_list(
            "public-routes",
            "STOREGATE_PUBLIC_ROUTES",
            "Path prefixes only shown to signed-out visitors",
            "/login,/register,/forgot-password",
        ))
        .arg(prefix_list(
            "login-endpoints",
            "STOREGATE_LOGIN_ENDPOINTS",
            "Paths whose POSTs count as login attempts",
            "/login,/api/auth/login",
        ))
        .arg(redirect(
            "login-path",
            "STOREGATE_LOGIN_PATH",
            "Where signed-out visitors are sent",
            "/login",
        ))
        .arg(redirect(
            "unauthorized-path",
            "STOREGATE_UNAUTHORIZED_PATH",
            "Where non-admins are sent from admin routes",
            "/",
        ))
        .arg(redirect(
            "maintenance-path",
            "STOREGATE_MAINTENANCE_PATH",
            "Maintenance page",
            "/maintenance",
        ))
        .arg(redirect(
            "home-path",
            "STOREGATE_HOME_PATH",
            "Where signed-in users are sent from public-only routes",
            "/",
        ))
        .arg(
            Arg::new("maintenance")
                .long("maintenance")
                .help("Redirect every page to the maintenance page")
                .env("STOREGATE_MAINTENANCE")
                .action(ArgAction::SetTrue),
        )
}
