use anyhow::{anyhow, Context};
use infohub_api::{AuthToken, ChangeRole, NewUser, Role, Team, UserId, Uuid};

#[derive(structopt::StructOpt)]
struct Opt {
    #[structopt(short, long, env = "INFOHUB_HOST", default_value = "http://127.0.0.1:3000")]
    host: String,

    #[structopt(subcommand)]
    cmd: Command,
}

#[derive(structopt::StructOpt)]
enum Command {
    /// Create a user
    CreateUser {
        full_name: String,

        email: String,

        /// Initial password
        password: String,

        /// One of the team names, eg. "Service Delivery"
        team: Team,

        /// Give the user the admin role
        #[structopt(long)]
        admin: bool,
    },

    /// Change the role of an existing user
    SetRole {
        user: Uuid,

        /// User or Admin
        role: Role,
    },
}

fn admin_token() -> anyhow::Result<AuthToken> {
    let tok =
        std::env::var("ADMIN_TOKEN").context("retrieving ADMIN_TOKEN environment variable")?;
    let tok = Uuid::try_parse(&tok).context("parsing ADMIN_TOKEN as an auth token")?;
    Ok(AuthToken(tok))
}

/// Turns error responses into the api error they carry
async fn check(resp: reqwest::Response) -> anyhow::Result<reqwest::Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.bytes().await.context("reading error response")?;
    match infohub_api::Error::parse(&body) {
        Ok(err) => Err(anyhow!(err)).context(format!("server answered {status}")),
        Err(_) => Err(anyhow!("server answered {status}: {body:?}")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = <Opt as structopt::StructOpt>::from_args();

    let client = reqwest::Client::new();

    match opt.cmd {
        Command::CreateUser {
            full_name,
            email,
            password,
            team,
            admin,
        } => {
            let mut user = NewUser::new(full_name, email, password, team);
            if admin {
                user.role = Role::Admin;
            }
            user.validate()?;
            let resp = client
                .post(format!("{}/api/admin/create-user", opt.host))
                .json(&user)
                .bearer_auth(admin_token()?.0)
                .send()
                .await
                .context("sending create-user request")?;
            let id: UserId = check(resp)
                .await?
                .json()
                .await
                .context("parsing created user id")?;
            println!("{}", id.0);
        }
        Command::SetRole { user, role } => {
            let resp = client
                .post(format!("{}/api/admin/users/{user}/role", opt.host))
                .json(&ChangeRole { role })
                .bearer_auth(admin_token()?.0)
                .send()
                .await
                .context("sending set-role request")?;
            check(resp).await?;
        }
    }

    Ok(())
}
